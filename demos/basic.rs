//! Minimal bough example: JSON endpoints, a binder plugin, static files and
//! health checks, with graceful shutdown on SIGINT/SIGTERM.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42
//!   curl http://localhost:3000/healthz
//!   kill -HUP <pid>     # reloads plugins, keeps serving

use bough::plugin::JsonBinder;
use bough::{App, Config, Error, Handler, handler, handler_fn, health, logging, middleware};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[tokio::main]
async fn main() -> bough::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    logging::init(&config.logging)?;

    let mut app = App::from_config(&config)?;
    app.register(JsonBinder::new("json"))?;

    app.pre(middleware::trace());
    app.global(middleware::server_info());
    app.global(middleware::request_id());

    app.get("/users/:id", get_user())?.set_name("user");
    app.post("/users", create_user())?;
    app.delete("/users/:id", handler_fn(|c| c.no_content(StatusCode::NO_CONTENT)))?;
    app.static_dir("/assets", "./public")?;
    app.get("/healthz", health::liveness())?;
    app.get("/readyz", health::readiness())?;

    app.build()?.run().await
}

// GET /users/:id
fn get_user() -> Handler {
    handler(|c| {
        Box::pin(async move {
            let id = c.param("id").to_owned();
            if id == "0" {
                return Err(Error::http(StatusCode::NOT_FOUND, "no such user"));
            }
            c.json(StatusCode::OK, &json!({ "id": id, "name": "alice" }))
        })
    })
}

// POST /users → 201 with a location pointing at the named `user` route.
fn create_user() -> Handler {
    handler_fn(|c| {
        let input: NewUser = c.bind("json")?;
        let id = c.gen_id().unwrap_or_default();
        let location = c.url("user", &[&id]).unwrap_or_default();
        c.set_header("location", &location)?;
        c.json(StatusCode::CREATED, &json!({ "id": id, "name": input.name }))
    })
}
