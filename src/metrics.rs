//! Prometheus text exposition of the container registry.

use crate::runtime::RuntimeVersion;
use crate::state::{Container, ContainerRegistry};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;

// =============================================================================
// Metrics Endpoint
// =============================================================================

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct MetricsState {
    pub containers: ContainerRegistry,
    pub version: Arc<RuntimeVersion>,
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    let body = render_prometheus(&state.containers.snapshot(), &state.version);
    (StatusCode::OK, [("content-type", CONTENT_TYPE)], body)
}

/// Escapes a label value: backslash, double quote and newline.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn labels(name: &str, container: &Container) -> String {
    format!(
        "image_id=\"{}\",name=\"{}\"",
        escape(&container.image),
        escape(name)
    )
}

/// Renders a registry snapshot plus the runtime version.
pub fn render_prometheus(containers: &[(String, Container)], version: &RuntimeVersion) -> String {
    let mut out = String::with_capacity(4096);
    let count = containers.len();

    out.push_str("# HELP docker_container_count Number of containers known to the runtime.\n");
    out.push_str("# TYPE docker_container_count gauge\n");
    out.push_str(&format!(
        "docker_container_count{{docker_container_count=\"{count}\"}} {count}\n"
    ));

    out.push_str(
        "# HELP docker_container_healthy 1 when the container is unhealthy or not running, 0 otherwise.\n",
    );
    out.push_str("# TYPE docker_container_healthy gauge\n");
    for (name, c) in containers {
        let problem = u8::from(c.is_unhealthy() || !c.is_running());
        out.push_str(&format!(
            "docker_container_healthy{{{}}} {problem}\n",
            labels(name, c)
        ));
    }

    out.push_str("# HELP docker_container_restart_count Restarts reported by the runtime.\n");
    out.push_str("# TYPE docker_container_restart_count counter\n");
    for (name, c) in containers {
        out.push_str(&format!(
            "docker_container_restart_count{{{}}} {}\n",
            labels(name, c),
            c.restart_count
        ));
    }

    out.push_str("# HELP docker_container_status Lifecycle state reported by the runtime.\n");
    out.push_str("# TYPE docker_container_status gauge\n");
    for (name, c) in containers {
        out.push_str(&format!(
            "docker_container_status{{{},docker_container_status=\"{}\"}} 1\n",
            labels(name, c),
            escape(&c.state)
        ));
    }

    out.push_str("# HELP docker_container_stuck_inspect 1 when the last inspect call failed.\n");
    out.push_str("# TYPE docker_container_stuck_inspect gauge\n");
    for (name, c) in containers {
        out.push_str(&format!(
            "docker_container_stuck_inspect{{{}}} {}\n",
            labels(name, c),
            u8::from(c.stuck_inspect)
        ));
    }

    out.push_str("# HELP docker_container_healed Restart attempts made by dkrmgr, by result.\n");
    out.push_str("# TYPE docker_container_healed counter\n");
    for (name, c) in containers {
        let labels = labels(name, c);
        out.push_str(&format!(
            "docker_container_healed{{{labels},status=\"success\"}} {}\n",
            c.healed.success
        ));
        out.push_str(&format!(
            "docker_container_healed{{{labels},status=\"fail\"}} {}\n",
            c.healed.fail
        ));
    }

    out.push_str("# HELP docker_version Docker daemon version.\n");
    out.push_str("# TYPE docker_version gauge\n");
    out.push_str(&format!(
        "docker_version{{docker_version=\"{}\"}} {}\n",
        escape(&version.full),
        version.numeric()
    ));

    out
}
