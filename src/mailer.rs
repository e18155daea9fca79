/// Password-reset dispatch. The transport is external: when a webhook sink
/// is configured the reset payload is POSTed there as JSON, otherwise the
/// link is printed for operators running without mail. Failures are logged
/// and swallowed — the reset endpoint never reveals delivery problems.
pub fn dispatch_reset(
    webhook_url: Option<String>,
    email: String,
    username: String,
    token: String,
) {
    tokio::spawn(async move {
        match webhook_url {
            Some(url) => {
                let client = reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(5))
                    .build()
                    .expect("Failed to create HTTP client");
                let payload = serde_json::json!({
                    "type": "password_reset",
                    "email": email,
                    "username": username,
                    "token": token,
                });
                if let Err(e) = client.post(&url).json(&payload).send().await {
                    eprintln!("⚠️ Reset mail webhook failed for {email}: {e}");
                }
            }
            None => {
                println!("📧 Password reset for {username} <{email}>: token {token}");
            }
        }
    });
}
