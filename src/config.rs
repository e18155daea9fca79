use sha2::{Digest, Sha256};
use std::env;
use std::path::PathBuf;

/// Process configuration, read once at startup from environment variables.
///
/// - `DATABASE_PATH` — SQLite file (default: data/concord.db)
/// - `TOKEN_SECRET` — HS256 signing secret for access tokens
/// - `ENCRYPTION_KEY` — 32 bytes hex; encrypts SFU credentials at rest
/// - `LIVEKIT_URL` / `LIVEKIT_API_KEY` / `LIVEKIT_API_SECRET` — default
///   platform-managed SFU instance, seeded on first start when set
/// - `UPLOAD_DIR` — directory served under /uploads (default: data/uploads)
/// - `UPLOAD_MAX_BYTES` — max decoded upload size (default: 10 MiB)
/// - `RESET_WEBHOOK_URL` — optional JSON sink for password-reset mail
pub struct Config {
    pub database_path: String,
    pub token_secret: String,
    pub encryption_key: [u8; 32],
    pub livekit_url: Option<String>,
    pub livekit_api_key: Option<String>,
    pub livekit_api_secret: Option<String>,
    pub upload_dir: PathBuf,
    pub upload_max_bytes: usize,
    pub reset_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "data/concord.db".to_string());
        let token_secret = env::var("TOKEN_SECRET").unwrap_or_else(|_| {
            eprintln!("⚠️  TOKEN_SECRET not set — using an insecure development secret");
            "concord-dev-secret".to_string()
        });
        let encryption_key = match env::var("ENCRYPTION_KEY") {
            Ok(hex_key) => parse_key(&hex_key).unwrap_or_else(|| {
                eprintln!("⚠️  ENCRYPTION_KEY is not 32 bytes of hex — deriving from TOKEN_SECRET");
                derive_key(&token_secret)
            }),
            Err(_) => derive_key(&token_secret),
        };

        Config {
            database_path,
            token_secret,
            encryption_key,
            livekit_url: env::var("LIVEKIT_URL").ok(),
            livekit_api_key: env::var("LIVEKIT_API_KEY").ok(),
            livekit_api_secret: env::var("LIVEKIT_API_SECRET").ok(),
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/uploads")),
            upload_max_bytes: env::var("UPLOAD_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            reset_webhook_url: env::var("RESET_WEBHOOK_URL").ok(),
        }
    }

    /// A config suitable for tests: given paths, derived key, no SFU seeded.
    pub fn for_testing(db_path: &str, upload_dir: &str) -> Self {
        Config {
            database_path: db_path.to_string(),
            token_secret: "test-secret".to_string(),
            encryption_key: derive_key("test-secret"),
            livekit_url: Some("ws://127.0.0.1:7880".to_string()),
            livekit_api_key: Some("devkey".to_string()),
            livekit_api_secret: Some("devsecret-devsecret-devsecret-00".to_string()),
            upload_dir: PathBuf::from(upload_dir),
            upload_max_bytes: 10 * 1024 * 1024,
            reset_webhook_url: None,
        }
    }
}

fn parse_key(hex_key: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim()).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(arr)
}

fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    digest.into()
}
