//! Drives a few requests through an instrumented service and prints what was emitted.
//!
//! Set `DOGSTATSD_ADDR` to also forward everything to a DogStatsD server.
use std::{convert::Infallible, env, time::Duration};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use metrics_httpstats::{CountingBody, DogStatsDOptions, ServerMetricsBuilder};
use metrics_rollup::DebuggingSink;
use tower::{service_fn, Layer, ServiceExt};
use tracing::{error, info};

async fn handle(req: Request<CountingBody<Full<Bytes>>>) -> Result<Response<Full<Bytes>>, Infallible> {
    let status = if req.uri().path() == "/missing" { StatusCode::NOT_FOUND } else { StatusCode::OK };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut response = Response::new(Full::new(Bytes::from(format!("{} {}", req.method(), req.uri()))));
    *response.status_mut() = status;
    Ok(response)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).init();

    let debugging = DebuggingSink::new();
    let mut builder = ServerMetricsBuilder::default()
        .with_tag("region", "us-west-2")
        .with_tag("host", "web-1")
        .with_request_tagger(|parts| ("route", parts.uri.path().to_owned()))
        .with_rollup_sink(debugging.clone(), ["region", "host"]);

    if let Ok(addr) = env::var("DOGSTATSD_ADDR") {
        let options = DogStatsDOptions::new(addr).with_prefix("example").with_flush_interval(Duration::from_secs(1));
        builder = match builder.with_dogstatsd_rollup(options, ["region", "host"]) {
            Ok(builder) => builder,
            Err(e) => {
                error!(error = %e, "Failed to configure DogStatsD sink.");
                return;
            }
        };
    }

    let layer = builder.build();
    for path in ["/", "/users", "/missing"] {
        let service = layer.layer(service_fn(handle));
        let req = Request::builder().uri(path).body(Full::new(Bytes::new())).expect("valid request");
        let response = service.oneshot(req).await.expect("infallible");
        let body = response.into_body().collect().await.expect("infallible").to_bytes();
        info!(path, body = ?body, "Handled request.");
    }

    for emission in debugging.emissions() {
        println!("{:<24} {}", emission.name(), emission.rendered_tags().join(","));
    }
}
