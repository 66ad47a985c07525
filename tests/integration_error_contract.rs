mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::HeaderMap;
use reqgate::{EndpointLimit, EndpointRateLimiter, ErrorCode, Item, RateLimit, Requester};

use crate::common::{ResponseSpec, TestServer};

fn requester() -> Requester {
    Requester::builder("test")
        .try_build()
        .expect("requester should build")
}

#[tokio::test]
async fn pre_network_failures_never_touch_the_server() {
    let server = TestServer::start(|_| ResponseSpec::json(r#"{"response":true}"#));
    let url = server.url("/");

    let requester = requester();

    let error = requester
        .send_payload(EndpointLimit::UnAuth, || Err("request item failure".into()))
        .await
        .expect_err("generator failure");
    assert_eq!(error.code(), ErrorCode::Generator);

    let error = requester
        .send_payload(EndpointLimit::UnAuth, || Ok(Item::new("")))
        .await
        .expect_err("empty path");
    assert_eq!(error.code(), ErrorCode::InvalidPath);

    let error = requester
        .send_payload(EndpointLimit::UnAuth, || Ok(Item::new("/relative/only")))
        .await
        .expect_err("relative path");
    assert_eq!(error.code(), ErrorCode::InvalidPath);

    let bad_method_url = url.clone();
    let error = requester
        .send_payload(EndpointLimit::UnAuth, move || {
            Ok(Item::new(bad_method_url).method("BAD METHOD"))
        })
        .await
        .expect_err("invalid method token");
    assert_eq!(error.code(), ErrorCode::InvalidMethod);

    let stale = Arc::downgrade(&Arc::new(Mutex::new(HeaderMap::new())));
    let stale_url = url.clone();
    let error = requester
        .send_payload(EndpointLimit::UnAuth, move || {
            Ok(Item::new(stale_url).header_target(stale))
        })
        .await
        .expect_err("dangling header target");
    assert_eq!(error.code(), ErrorCode::HeaderTargetGone);

    let scoped = Requester::builder("scoped")
        .limiter(Arc::new(EndpointRateLimiter::new().with_bucket(
            EndpointLimit::Auth,
            RateLimit::new(Duration::from_secs(1), 10),
        )))
        .try_build()
        .expect("requester should build");
    let unconfigured_url = url.clone();
    let error = scoped
        .send_payload(EndpointLimit::UnAuth, move || {
            Ok(Item::new(unconfigured_url))
        })
        .await
        .expect_err("unconfigured endpoint classification");
    assert_eq!(error.code(), ErrorCode::EndpointLimitNotFound);

    assert_eq!(server.requests_served(), 0);
}

#[tokio::test]
async fn job_ceiling_declines_the_overflow_call_only() {
    let server = TestServer::start(|_| {
        ResponseSpec::json(r#"{"response":true}"#).delay(Duration::from_millis(300))
    });
    let requester = Arc::new(
        Requester::builder("test")
            .max_request_jobs(1)
            .try_build()
            .expect("requester should build"),
    );

    let in_flight = {
        let requester = Arc::clone(&requester);
        let url = server.url("/");
        tokio::spawn(async move {
            requester
                .send_payload(EndpointLimit::UnAuth, move || Ok(Item::new(url)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = server.url("/");
    let error = requester
        .send_payload(EndpointLimit::UnAuth, move || Ok(Item::new(url)))
        .await
        .expect_err("overflow call must be declined");
    assert_eq!(error.code(), ErrorCode::TooManyRequestJobs);

    in_flight
        .await
        .expect("in-flight caller should not panic")
        .expect("in-flight call should succeed");

    let url = server.url("/");
    requester
        .send_payload(EndpointLimit::UnAuth, move || Ok(Item::new(url)))
        .await
        .expect("released slot admits the next call");
    assert_eq!(server.requests_served(), 2);
    assert_eq!(requester.metrics_snapshot().jobs_declined, 1);
}

#[tokio::test]
async fn failed_proxy_install_leaves_the_transport_working() {
    let server = TestServer::start(|_| ResponseSpec::json(r#"{"response":true}"#));
    let requester = requester();

    let url = server.url("/");
    let first_url = url.clone();
    requester
        .send_payload(EndpointLimit::UnAuth, move || Ok(Item::new(first_url)))
        .await
        .expect("direct call should succeed");

    assert_eq!(
        requester.set_proxy("").expect_err("empty proxy").code(),
        ErrorCode::InvalidProxy
    );
    assert_eq!(
        requester
            .set_proxy("not a proxy url")
            .expect_err("garbage proxy")
            .code(),
        ErrorCode::InvalidProxy
    );

    requester
        .send_payload(EndpointLimit::UnAuth, move || Ok(Item::new(url)))
        .await
        .expect("transport must be untouched after rejected proxies");
    assert_eq!(server.requests_served(), 2);
}

#[tokio::test]
async fn decode_failure_surfaces_and_leaves_the_target_untouched() {
    let server = TestServer::start(|_| ResponseSpec::json("{not json"));
    let requester = requester();

    #[derive(Debug, serde::Deserialize)]
    struct Flag {
        #[serde(rename = "response")]
        _response: bool,
    }

    let decoded: Arc<Mutex<Option<Flag>>> = Arc::new(Mutex::new(None));
    let url = server.url("/");
    let target = Arc::clone(&decoded);
    let error = requester
        .send_payload(EndpointLimit::UnAuth, move || {
            Ok(Item::new(url).decode_into(&target))
        })
        .await
        .expect_err("malformed body must fail to decode");
    assert_eq!(error.code(), ErrorCode::Decode);
    assert!(decoded.lock().expect("decoded lock").is_none());
}
