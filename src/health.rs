use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Liveness of the accept loop plus session counts.
///
/// Returns 503 once shutdown has begun so load balancers stop routing new
/// clients here while existing sessions drain.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let totals = state.registry.totals();
    let accepting = state.is_accepting();
    let config = &state.config;

    let body = json!({
        "status": if accepting { "healthy" } else { "draining" },
        "accepting": accepting,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": totals.active,
            "created": totals.created,
            "closed": totals.closed,
            "rejected": totals.rejected,
            "max": config.performance.max_concurrent_sessions
        },
        "system": load_status(totals.active, config.performance.max_concurrent_sessions)
    });

    if accepting {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Every open session, oldest first.
pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.registry.snapshot();
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    }))
}

fn load_status(active: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 {
        active as f64 / max as f64
    } else {
        0.0
    };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round(),
        "load_warnings": if usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::test::{call_and_read_body_json, call_service, init_service, TestRequest};
    use actix_web::App;

    #[test]
    fn test_load_status_thresholds() {
        assert_eq!(load_status(10, 100)["status"], "normal");
        assert_eq!(load_status(80, 100)["status"], "moderate_load");
        assert_eq!(load_status(95, 100)["status"], "high_load");
        assert_eq!(load_status(0, 0)["status"], "normal");
    }

    #[actix_web::test]
    async fn test_health_reports_sessions_and_draining() {
        let state = AppState::new(AppConfig::default());
        let _lease = state
            .registry
            .register("s1", "peer", tokio::sync::mpsc::unbounded_channel().0)
            .unwrap();

        let app = init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 1);

        state.registry.shutdown_all();
        let req = TestRequest::get().uri("/health").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_sessions_endpoint_lists_snapshot() {
        let state = AppState::new(AppConfig::default());
        let _lease = state
            .registry
            .register("s1", "10.1.2.3", tokio::sync::mpsc::unbounded_channel().0)
            .unwrap();

        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/sessions", web::get().to(list_sessions)),
        )
        .await;

        let req = TestRequest::get().uri("/sessions").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], "s1");
        assert_eq!(body["sessions"][0]["peer"], "10.1.2.3");
    }
}
