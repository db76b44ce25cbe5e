use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration, with the service credential redacted.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    let mut config = (*state.config).clone();
    config.upstream.api_key = redact(&config.upstream.api_key);

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    }))
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}
