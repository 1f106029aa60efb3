use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

use super::state::LbState;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: u16, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

/// Read-only status endpoints over the registry: `/nodes`, `/nodes/:id`,
/// `/healthz`, `/metrics`. A simple query contract, no mutation surface.
pub fn handle_introspection(
    req: Request<Incoming>,
    state: LbState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap()),

        "/nodes" => {
            let nodes = state.registry.snapshot();
            let body = serde_json::to_string(&nodes).unwrap_or_default();
            Ok(json_response(200, body))
        }

        path => {
            if let Some(id) = path.strip_prefix("/nodes/") {
                let key = crate::registry::NodeKey::new(
                    match id.parse() {
                        Ok(addr) => addr,
                        Err(_) => return Ok(json_response(400, r#"{"error":"invalid node id"}"#.to_string())),
                    },
                );
                return match state.registry.get(&key) {
                    Some(summary) => Ok(json_response(200, serde_json::to_string(&summary).unwrap_or_default())),
                    None => Ok(json_response(404, r#"{"error":"not found"}"#.to_string())),
                };
            }
            Ok(json_response(404, r#"{"error":"not found"}"#.to_string()))
        }
    }
}
