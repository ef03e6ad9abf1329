//! Demo binary: a minimal HTTP server wiring `HttpProcessor` + `Router`
//! on top of the generic acceptor.

use corehttpd::http::{HttpProcessor, MethodMask, RouteResponse, Router};
use corehttpd::net::run_tcp;
use corehttpd::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn build_router() -> Router {
    let mut router = Router::new();

    router.register(
        "/",
        MethodMask::ANY,
        "text/plain",
        Box::new(|_req, _buf| RouteResponse::new(200, "text/plain", b"corehttpd\n".to_vec())),
    );

    router.register(
        "/echo/?",
        MethodMask::ANY,
        "text/plain",
        Box::new(|req, _buf| {
            let path = String::from_utf8_lossy(req.path()).into_owned();
            let segment = path.rsplit('/').next().unwrap_or("").to_string();
            RouteResponse::new(200, "text/plain", segment.into_bytes())
        }),
    );

    router.register(
        "/greet",
        MethodMask::ANY,
        "text/plain",
        Box::new(|req, _buf| {
            let name = req
                .query_value("name")
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_else(|| "world".to_string());
            RouteResponse::new(200, "text/plain", format!("hello, {name}\n").into_bytes())
        }),
    );

    router
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(ip = %config.ip, port = config.port, "starting corehttpd http demo");
    run_tcp(
        {
            let config = config.clone();
            move || HttpProcessor::new(build_router(), &config)
        },
        config,
    )?;
    Ok(())
}
