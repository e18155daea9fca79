use crate::crypto;
use crate::db::{now_ts, Db};
use crate::models::MetricsSummary;
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// Interval between SFU metric sweeps (seconds).
const COLLECT_INTERVAL_SECS: u64 = 5 * 60;

/// Spawns a background task that periodically scrapes every registered SFU
/// instance's Prometheus endpoint and records a snapshot. Scrape failures
/// mark the snapshot unavailable and never surface to request paths.
pub fn spawn_collector(db: Db, encryption_key: [u8; 32]) {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        // Initial delay: let the server start up before the first sweep
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;

        // Raw byte counters from the previous sweep, per instance. Rates are
        // deltas over the interval; history restarts with the process.
        let mut prior_counters: HashMap<String, (f64, f64)> = HashMap::new();

        loop {
            let instances: Vec<(String, String, String)> = {
                let conn = db.conn();
                conn.prepare("SELECT id, url, api_key_enc FROM livekit_instances")
                    .and_then(|mut stmt| {
                        let rows = stmt
                            .query_map([], |row| {
                                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                            })?
                            .filter_map(|r| r.ok())
                            .collect();
                        Ok(rows)
                    })
                    .unwrap_or_default()
            };

            for (instance_id, url, api_key_enc) in instances {
                let api_key = crypto::open(&api_key_enc, &encryption_key);
                let prior = prior_counters.get(&instance_id).copied();
                if let Some(counters) =
                    collect_instance(&db, &client, &instance_id, &url, api_key.as_deref(), prior)
                        .await
                {
                    prior_counters.insert(instance_id, counters);
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(COLLECT_INTERVAL_SECS)).await;
        }
    });
}

/// Returns the raw byte counters on a successful scrape so the next sweep
/// can derive rates.
async fn collect_instance(
    db: &Db,
    client: &reqwest::Client,
    instance_id: &str,
    url: &str,
    api_key: Option<&str>,
    prior_counters: Option<(f64, f64)>,
) -> Option<(f64, f64)> {
    let endpoint = format!("{}/metrics", scrape_base(url));
    let mut request = client.get(&endpoint);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let body = match request.send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(text) => Some(text),
            Err(e) => {
                eprintln!("⚠️ SFU metrics read failed for {instance_id}: {e}");
                None
            }
        },
        Ok(resp) => {
            eprintln!("⚠️ SFU metrics scrape for {instance_id}: HTTP {}", resp.status());
            None
        }
        Err(e) => {
            eprintln!("⚠️ SFU metrics scrape failed for {instance_id}: {e}");
            None
        }
    };

    let conn = db.conn();
    let now = now_ts();
    let result = match body {
        Some(text) => {
            let families = parse_prometheus(&text);
            let participants = *families.get("livekit_participant_total").unwrap_or(&0.0);
            let rooms = *families.get("livekit_room_total").unwrap_or(&0.0);
            let memory = *families.get("process_resident_memory_bytes").unwrap_or(&0.0);
            let cpu = *families.get("livekit_node_cpu_load").unwrap_or(&0.0);
            let bytes_in = *families.get("livekit_bytes_in_total").unwrap_or(&0.0);
            let bytes_out = *families.get("livekit_bytes_out_total").unwrap_or(&0.0);

            // Counter deltas over the interval; a counter reset reads as 0.
            let interval = COLLECT_INTERVAL_SECS as f64;
            let (in_rate, out_rate) = match prior_counters {
                Some((prev_in, prev_out)) => (
                    ((bytes_in - prev_in) / interval).max(0.0),
                    ((bytes_out - prev_out) / interval).max(0.0),
                ),
                None => (0.0, 0.0),
            };

            conn.execute(
                "INSERT INTO metrics_snapshots
                 (instance_id, created_at, available, participants, rooms,
                  memory_bytes, cpu_load, bytes_in_rate, bytes_out_rate)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    instance_id,
                    now,
                    participants as i64,
                    rooms as i64,
                    memory as i64,
                    cpu,
                    in_rate,
                    out_rate
                ],
            )
            .ok();
            Some((bytes_in, bytes_out))
        }
        None => {
            conn.execute(
                "INSERT INTO metrics_snapshots (instance_id, created_at, available)
                 VALUES (?1, ?2, 0)",
                params![instance_id, now],
            )
            .ok();
            None
        }
    };

    // Keep 31 days of history.
    conn.execute(
        "DELETE FROM metrics_snapshots
         WHERE instance_id = ?1 AND datetime(created_at) < datetime('now', '-31 days')",
        params![instance_id],
    )
    .ok();

    result
}

/// The instance URL is the client-facing ws(s) address; metrics live on the
/// same host over http(s).
fn scrape_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        trimmed.to_string()
    }
}

/// Sum Prometheus text-format samples by family name, labels ignored.
pub fn parse_prometheus(text: &str) -> HashMap<String, f64> {
    let mut families: HashMap<String, f64> = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name_part, value_part)) = line.rsplit_once(' ') else {
            continue;
        };
        let name = match name_part.find('{') {
            Some(idx) => &name_part[..idx],
            None => name_part,
        };
        // A timestamp may trail the value; the value is the first token.
        let value_token = value_part.split_whitespace().next().unwrap_or(value_part);
        if let Ok(value) = value_token.parse::<f64>() {
            *families.entry(name.to_string()).or_insert(0.0) += value;
        }
    }
    families
}

/// Peak/average aggregates over a retention window ('-24 hours', '-7 days',
/// '-30 days' in SQLite modifier form).
pub fn summarize(
    conn: &Connection,
    instance_id: &str,
    window_label: &str,
    modifier: &str,
) -> MetricsSummary {
    conn.query_row(
        "SELECT COALESCE(MAX(participants), 0), COALESCE(AVG(participants), 0),
                COALESCE(MAX(rooms), 0), COALESCE(AVG(cpu_load), 0), COUNT(*)
         FROM metrics_snapshots
         WHERE instance_id = ?1 AND available = 1
           AND datetime(created_at) >= datetime('now', ?2)",
        params![instance_id, modifier],
        |r| {
            Ok(MetricsSummary {
                window: window_label.to_string(),
                peak_participants: r.get(0)?,
                avg_participants: r.get(1)?,
                peak_rooms: r.get(2)?,
                avg_cpu_load: r.get(3)?,
                samples: r.get(4)?,
            })
        },
    )
    .unwrap_or(MetricsSummary {
        window: window_label.to_string(),
        peak_participants: 0,
        avg_participants: 0.0,
        peak_rooms: 0,
        avg_cpu_load: 0.0,
        samples: 0,
    })
}
