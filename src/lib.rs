pub mod calls;
pub mod config;
pub mod crypto;
pub mod db;
pub mod events;
pub mod hub;
pub mod mailer;
pub mod metrics;
pub mod models;
pub mod permissions;
pub mod rate_limit;
pub mod routes;
pub mod voice;

use calls::CallCoordinator;
use config::Config;
use db::{now_ts, Db};
use events::EventBus;
use hub::Hub;
use rate_limit::{RateLimitConfig, RateLimiter};
use rocket::fs::FileServer;
use rocket_cors::CorsOptions;
use rusqlite::params;
use std::sync::Arc;
use voice::VoiceRegistry;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(Config::from_env(), RateLimitConfig::from_env(), true)
}

/// Test entry point: explicit config, default rate limits, no background
/// collectors.
pub fn rocket_with_config(config: Config) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, RateLimitConfig::default(), false)
}

pub fn rocket_with_config_and_limits(
    config: Config,
    rate_config: RateLimitConfig,
) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, rate_config, false)
}

fn build_rocket(
    config: Config,
    rate_limit_config: RateLimitConfig,
    background_tasks: bool,
) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::create_dir_all(&config.upload_dir).ok();

    let db = Db::new(&config.database_path);
    seed_default_instance(&db, &config);

    let events = EventBus::new();
    let hub = Arc::new(Hub::new());
    let voice = Arc::new(VoiceRegistry::new());
    let calls = Arc::new(CallCoordinator::new(events.sender.clone()));
    let rate_limiter = RateLimiter::new();

    // The hub is the only subscriber that reaches clients. Subscribe before
    // Rocket takes the EventBus so no liftoff-time event is missed.
    let dispatcher_hub = hub.clone();
    let dispatcher_rx = events.sender.subscribe();

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    // Base64-encoded attachments ride inside JSON bodies.
    let figment = rocket::Config::figment().merge(("limits.json", 16 * 1024 * 1024));

    let upload_dir = config.upload_dir.clone();
    let metrics_db = db.clone();
    let metrics_key = config.encryption_key;

    let mut build = rocket::custom(figment)
        .manage(db)
        .manage(config)
        .manage(events)
        .manage(hub)
        .manage(voice)
        .manage(calls)
        .manage(rate_limit_config)
        .manage(rate_limiter)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::unauthorized,
                routes::forbidden_catcher,
                routes::not_found,
                routes::too_many_requests,
                routes::internal_error,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                // auth
                routes::register,
                routes::login,
                routes::refresh,
                routes::logout,
                routes::change_password,
                routes::request_reset,
                routes::apply_reset,
                // users
                routes::get_me,
                routes::update_me,
                // servers
                routes::list_servers,
                routes::create_server,
                routes::get_server,
                routes::update_server,
                routes::delete_server,
                routes::leave_server,
                routes::reorder_servers,
                routes::upload_icon,
                // channels & categories & overrides
                routes::list_channels,
                routes::create_channel,
                routes::update_channel,
                routes::delete_channel,
                routes::reorder_channels,
                routes::list_categories,
                routes::create_category,
                routes::update_category,
                routes::delete_category,
                routes::get_overrides,
                routes::put_override,
                routes::delete_override,
                // messages
                routes::send_message,
                routes::get_messages,
                routes::edit_message,
                routes::delete_message,
                // reactions & pins
                routes::toggle_reaction,
                routes::pin_message,
                routes::unpin_message,
                routes::list_pins,
                // roles
                routes::list_roles,
                routes::create_role,
                routes::update_role,
                routes::delete_role,
                routes::reorder_roles,
                // members & bans
                routes::list_members,
                routes::get_member,
                routes::update_member_roles,
                routes::kick_member,
                routes::ban_member,
                routes::list_bans,
                routes::delete_ban,
                // invites
                routes::list_invites,
                routes::create_invite,
                routes::delete_invite,
                routes::preview_invite,
                routes::accept_invite,
                // read state
                routes::mark_read,
                routes::get_unread,
                // friends
                routes::list_friends,
                routes::send_friend_request,
                routes::accept_friend_request,
                routes::decline_friend_request,
                routes::remove_friend,
                routes::block_user,
                routes::unblock_user,
                // dms
                routes::open_dm,
                routes::list_dms,
                routes::send_dm_message,
                routes::get_dm_messages,
                routes::edit_dm_message,
                routes::delete_dm_message,
                routes::toggle_dm_reaction,
                routes::pin_dm_message,
                routes::unpin_dm_message,
                routes::get_dm_pins,
                routes::mark_dm_read,
                routes::dm_search,
                // search
                routes::search_messages,
                // voice
                routes::voice_token,
                routes::voice_states,
                // admin
                routes::admin_list_instances,
                routes::admin_create_instance,
                routes::admin_update_instance,
                routes::admin_delete_instance,
                routes::admin_instance_metrics,
                routes::admin_instance_metrics_history,
                routes::admin_list_servers,
                routes::admin_list_users,
                routes::admin_assign_instance,
                // push channel
                routes::ws_connect,
            ],
        )
        .mount("/uploads", FileServer::from(upload_dir).rank(20))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Push Dispatcher",
            move |_rocket| {
                Box::pin(async move {
                    hub::spawn_dispatcher(dispatcher_hub, dispatcher_rx);
                    println!("📡 Push dispatcher started");
                })
            },
        ));

    if background_tasks {
        build = build.attach(rocket::fairing::AdHoc::on_liftoff(
            "SFU Metrics Collector",
            move |_rocket| {
                Box::pin(async move {
                    metrics::spawn_collector(metrics_db, metrics_key);
                    println!("📈 SFU metrics collector started");
                })
            },
        ));
    }

    build
}

/// Seed the platform-managed SFU instance from the environment on first
/// start, so hosted deployments work without touching the admin surface.
fn seed_default_instance(db: &Db, config: &Config) {
    let (Some(url), Some(key), Some(secret)) = (
        config.livekit_url.as_deref(),
        config.livekit_api_key.as_deref(),
        config.livekit_api_secret.as_deref(),
    ) else {
        return;
    };

    let conn = db.conn();
    let existing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM livekit_instances WHERE is_platform_managed = 1",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);
    if existing > 0 {
        return;
    }
    conn.execute(
        "INSERT INTO livekit_instances
         (id, url, api_key_enc, api_secret_enc, is_platform_managed, max_servers, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, 100, ?5)",
        params![
            crypto::generate_id(),
            url,
            crypto::seal(key, &config.encryption_key),
            crypto::seal(secret, &config.encryption_key),
            now_ts()
        ],
    )
    .ok();
}
