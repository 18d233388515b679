//! Demo binary: wires the sample route table and serves on 127.0.0.1:8080.

use serde_json::{json, Value};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use hearth::http::url::ParamMap;
use hearth::http::{Response, StatusCode};
use hearth::router::{middleware, Router};
use hearth::server::{Server, ServerConfig, ServerError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    if let Err(e) = run() {
        error!("server error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), ServerError> {
    let server = Server::new(ServerConfig::default(), build_router())?;
    server.run()
}

fn build_router() -> Router {
    let mut router = Router::new();

    router.add_middleware_fn(middleware::request_logger());
    router.add_middleware_fn(middleware::bearer_auth("/user/", "dummy_token"));

    router.get("/", |_req, _params, _json| {
        Response::new(StatusCode::Ok, "text/plain", "Welcome to the home page!")
    });
    router.get("/about", |_req, _params, _json| {
        Response::new(StatusCode::Ok, "text/plain", "About page: This is a simple server.")
    });
    router.post("/echo", |req, _params, _json| {
        Response::new(StatusCode::Ok, "text/plain", req.body().clone())
    });
    router.post("/json", |req, _params, json| match json {
        Some(value) => {
            let name = value.get("name").and_then(Value::as_str).unwrap_or("Unknown");
            Response::json(
                StatusCode::Ok,
                &json!({"status": "received", "name": name, "size": req.body().len()}),
            )
        }
        None => Response::json(
            StatusCode::BadRequest,
            &json!({"error": "Missing or invalid JSON body"}),
        ),
    });
    router.get("/query", |req, _params, _json| {
        Response::json(StatusCode::Ok, &params_to_json(req.query_params()))
    });
    router.post("/form", |req, _params, _json| {
        if req.form_params().is_empty() {
            return Response::json(
                StatusCode::BadRequest,
                &json!({"error": "No form data or invalid Content-Type"}),
            );
        }
        Response::json(StatusCode::Ok, &params_to_json(req.form_params()))
    });

    router.get("/user/:id", |_req, params, _json| {
        Response::json(
            StatusCode::Ok,
            &json!({"id": params["id"], "message": "User found"}),
        )
    });
    router.put("/user/:id", |_req, params, json| match json {
        Some(value) => Response::json(
            StatusCode::Ok,
            &json!({"id": params["id"], "message": "User updated", "data": value}),
        ),
        None => Response::json(StatusCode::BadRequest, &json!({"error": "Missing JSON body"})),
    });
    router.delete("/user/:id", |_req, params, _json| {
        Response::json(
            StatusCode::Ok,
            &json!({"id": params["id"], "message": "User deleted"}),
        )
    });
    router.patch("/user/:id", |_req, params, json| match json {
        Some(value) => Response::json(
            StatusCode::Ok,
            &json!({"id": params["id"], "message": "User patched", "data": value}),
        ),
        None => Response::json(StatusCode::BadRequest, &json!({"error": "Missing JSON body"})),
    });

    if let Err(e) = router.serve_static("static", "/assets/") {
        warn!(error = %e, "static file serving disabled");
    }

    router
}

/// Echoes a parameter multimap as JSON: single values as strings, repeated
/// keys as arrays.
fn params_to_json(params: &ParamMap) -> Value {
    let mut object = serde_json::Map::new();
    for (key, values) in params {
        let value = match values.as_slice() {
            [single] => Value::String(single.clone()),
            many => Value::Array(many.iter().cloned().map(Value::String).collect()),
        };
        object.insert(key.clone(), value);
    }
    Value::Object(object)
}
