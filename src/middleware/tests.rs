use crate::backend::Decision;
use crate::middleware::builder::TOO_MANY_REQUESTS_MESSAGE;
use crate::middleware::*;
use actix_web::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use actix_web::test::{read_body, TestRequest};
use actix_web::{get, test, App, HttpResponse, Responder};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DENIED_BODY: &str = r#"{"error":"Too many requests, please try again later"}"#;

#[get("/200")]
async fn route_200() -> impl Responder {
    HttpResponse::Ok().body("Hello world!")
}

#[get("/500")]
async fn route_500() -> impl Responder {
    HttpResponse::InternalServerError().body("Internal error")
}

#[get("/api/items")]
async fn route_api() -> impl Responder {
    HttpResponse::Ok().body("Items")
}

#[get("/public")]
async fn route_public() -> impl Responder {
    HttpResponse::Ok().body("Public")
}

#[derive(Clone, Default)]
struct MockBackend(Arc<MockBackendInner>);

#[derive(Default)]
struct MockBackendInner {
    counter: AtomicU64,
}

struct MockBackendInput<T> {
    max: u64,
    output: T,
    backend_error: Option<MockError>,
}

#[derive(Debug, Clone, Default)]
struct MockError;

impl Display for MockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mock backend error")
    }
}

impl<T: 'static> Backend<MockBackendInput<T>> for MockBackend {
    type Output = T;
    type RollbackToken = ();
    type Error = MockError;

    async fn request(
        &self,
        input: MockBackendInput<T>,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        if let Some(e) = input.backend_error {
            return Err(e);
        }
        let allow = self.0.counter.fetch_add(1, Ordering::Relaxed) < input.max;
        Ok((Decision::from_allowed(allow), input.output, ()))
    }

    async fn rollback(&self, _token: Self::RollbackToken) -> Result<(), Self::Error> {
        self.0.counter.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn body_string(response: ServiceResponse<impl actix_web::body::MessageBody>) -> String {
    String::from_utf8(read_body(response).await.to_vec()).unwrap()
}

#[actix_web::test]
async fn test_allow_deny() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend,
        |_req| async {
            Ok(Some(MockBackendInput {
                max: 1,
                output: (),
                backend_error: None,
            }))
        },
        FailurePolicy::Closed,
    )
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    assert!(
        test::call_service(&app, TestRequest::get().uri("/200").to_request())
            .await
            .status()
            .is_success()
    );
    assert_eq!(
        test::call_service(&app, TestRequest::get().uri("/200").to_request())
            .await
            .status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[actix_web::test]
async fn test_default_deny_response() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend,
        |_req| async {
            Ok(Some(MockBackendInput {
                max: 0,
                output: (),
                backend_error: None,
            }))
        },
        FailurePolicy::Closed,
    )
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(body_string(response).await, DENIED_BODY);
    assert!(DENIED_BODY.contains(TOO_MANY_REQUESTS_MESSAGE));
}

#[actix_web::test]
async fn test_custom_deny_response() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend,
        |_req| async {
            Ok(Some(MockBackendInput {
                max: 0,
                output: StatusCode::IM_A_TEAPOT,
                backend_error: None,
            }))
        },
        FailurePolicy::Closed,
    )
    .request_denied_response(|output: Option<&StatusCode>| {
        HttpResponse::build(*output.unwrap()).body("Custom denied response")
    })
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(body_string(response).await, "Custom denied response");
}

#[actix_web::test]
async fn test_header_transformation() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend,
        |_req| async {
            Ok(Some(MockBackendInput {
                max: u64::MAX,
                output: "abc".to_string(),
                backend_error: None,
            }))
        },
        FailurePolicy::Closed,
    )
    .request_allowed_transformation(Some(
        |headers: &mut HeaderMap, output: Option<&String>, _rolled_back: bool| {
            assert!(
                output.is_some(),
                "Backend is working so output should be some"
            );
            headers.insert(
                HeaderName::from_static("test-header"),
                HeaderValue::from_str(output.unwrap()).unwrap(),
            );
        },
    ))
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("test-header")
            .unwrap()
            .to_str()
            .unwrap(),
        "abc"
    );
}

#[actix_web::test]
async fn test_fail_closed() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend,
        |_req| async {
            Ok(Some(MockBackendInput {
                max: u64::MAX,
                output: (),
                backend_error: Some(MockError),
            }))
        },
        FailurePolicy::Closed,
    )
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // Nothing from the backend error leaks into the response
    assert_eq!(body_string(response).await, DENIED_BODY);
}

#[actix_web::test]
async fn test_fail_open() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend,
        |_req| async {
            Ok(Some(MockBackendInput {
                max: u64::MAX,
                output: (),
                backend_error: Some(MockError),
            }))
        },
        FailurePolicy::Open,
    )
    .request_allowed_transformation(Some(
        |map: &mut HeaderMap, output: Option<&()>, _rolled_back: bool| {
            map.insert(
                HeaderName::from_static("custom-header"),
                HeaderValue::from_static(""),
            );
            assert!(output.is_none());
        },
    ))
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("custom-header"))
}

#[actix_web::test]
async fn test_rollback() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend.clone(),
        |_req| async {
            Ok(Some(MockBackendInput {
                max: u64::MAX,
                output: (),
                backend_error: None,
            }))
        },
        FailurePolicy::Closed,
    )
    .rollback_server_errors()
    .request_allowed_transformation(Some(
        |map: &mut HeaderMap, _output: Option<&()>, rolled_back: bool| {
            map.insert(
                HeaderName::from_static("rolled-back"),
                HeaderValue::from(rolled_back as u16),
            );
        },
    ))
    .build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .service(route_500)
            .wrap(limiter),
    )
    .await;

    // Confirm count increases for a 200 response
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("rolled-back").unwrap(), "0");
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 1);

    // Confirm count hasn't increased
    let response = test::call_service(&app, TestRequest::get().uri("/500").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers().get("rolled-back").unwrap(), "1");
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 1);
}

#[actix_web::test]
async fn test_unidentified_not_limited() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend.clone(),
        |_req| async { Ok(None::<MockBackendInput<()>>) },
        FailurePolicy::Closed,
    )
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    for _ in 0..3 {
        let response =
            test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    // The backend was never consulted
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 0);
}

#[actix_web::test]
async fn test_input_error() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend.clone(),
        |_req| async {
            Err::<Option<MockBackendInput<()>>, _>(actix_web::error::ErrorBadRequest("No key"))
        },
        FailurePolicy::Open,
    )
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 0);
}

#[actix_web::test]
async fn test_scope() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(
        backend.clone(),
        |_req| async {
            Ok(Some(MockBackendInput {
                max: 0,
                output: (),
                backend_error: None,
            }))
        },
        FailurePolicy::Closed,
    )
    .scope("/api")
    .build();
    let app = test::init_service(
        App::new()
            .service(route_api)
            .service(route_public)
            .wrap(limiter),
    )
    .await;
    let response = test::call_service(&app, TestRequest::get().uri("/public").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 0);

    let response =
        test::call_service(&app, TestRequest::get().uri("/api/items").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 1);
}

#[actix_web::test]
async fn test_matches_scope() {
    assert!(matches_scope("/api", "/api"));
    assert!(matches_scope("/api", "/api/"));
    assert!(matches_scope("/api", "/api/users/1"));
    assert!(matches_scope("/api/", "/api/users"));
    assert!(!matches_scope("/api", "/apiary"));
    assert!(!matches_scope("/api", "/"));
    assert!(matches_scope("/", "/anything"));
    assert!(in_scope(&[], "/anything"));
    assert!(in_scope(
        &["/admin".to_string(), "/api".to_string()],
        "/api/users"
    ));
    assert!(!in_scope(&["/admin".to_string()], "/api/users"));
}

#[cfg(feature = "dashmap")]
mod sliding_window {
    use super::*;
    use crate::backend::{SimpleInputFunctionBuilder, SlidingWindowBackend};
    use crate::clock::ManualClock;
    use crate::middleware::builder::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
    use crate::store::testing::{Mode, TestStore};
    use actix_web::dev::Service;
    use actix_web::http::header::RETRY_AFTER;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);
    // Aligned to the start of a minute
    const START: Duration = Duration::from_secs(60 * 28_333_333);

    fn make_backend(store: &TestStore) -> SlidingWindowBackend<TestStore> {
        SlidingWindowBackend::builder(store.clone())
            .clock(ManualClock::new(START + Duration::from_millis(15_500)))
            .build()
    }

    fn from_ip(ip: &str) -> TestRequest {
        TestRequest::get()
            .uri("/api/items")
            .insert_header(("x-forwarded-for", ip))
    }

    #[actix_web::test]
    async fn test_quota() {
        let store = TestStore::new();
        let limiter = RateLimiter::builder(
            make_backend(&store),
            SimpleInputFunctionBuilder::new(MINUTE, 3).build(),
            FailurePolicy::Closed,
        )
        .scope("/api")
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;
        for _ in 0..3 {
            let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(response).await, DENIED_BODY);

        // Another client is unaffected
        let response = test::call_service(&app, from_ip("203.0.113.8, 10.0.0.1").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_unidentified_client_skips_store() {
        let store = TestStore::new();
        let limiter = RateLimiter::builder(
            make_backend(&store),
            SimpleInputFunctionBuilder::new(MINUTE, 1).build(),
            FailurePolicy::Closed,
        )
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;
        for _ in 0..3 {
            let response =
                test::call_service(&app, TestRequest::get().uri("/api/items").to_request()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(store.calls(), 0);
    }

    #[actix_web::test]
    async fn test_client_abort_still_counted() {
        let store = TestStore::new().yielding();
        let limiter = RateLimiter::builder(
            make_backend(&store),
            SimpleInputFunctionBuilder::new(MINUTE, 1).build(),
            FailurePolicy::Closed,
        )
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;

        // Start the request, then drop it while the store calls are still pending
        let mut call = Box::pin(app.call(from_ip("203.0.113.7").to_request()));
        assert!(futures::poll!(call.as_mut()).is_pending());
        drop(call);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Both the read and the increment went through
        assert_eq!(store.calls(), 2);
        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[actix_web::test]
    async fn test_add_headers() {
        let store = TestStore::new();
        let limiter = RateLimiter::builder(
            make_backend(&store),
            SimpleInputFunctionBuilder::new(MINUTE, 2).build(),
            FailurePolicy::Closed,
        )
        .add_headers()
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;

        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get(&*X_RATELIMIT_LIMIT).unwrap(), "2");
        assert_eq!(headers.get(&*X_RATELIMIT_REMAINING).unwrap(), "1");
        assert_eq!(headers.get(&*X_RATELIMIT_RESET).unwrap(), "45");
        assert!(!headers.contains_key(RETRY_AFTER));

        test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get(&*X_RATELIMIT_REMAINING).unwrap(), "0");
        assert_eq!(headers.get(RETRY_AFTER).unwrap(), "45");
        assert_eq!(body_string(response).await, DENIED_BODY);
    }

    #[actix_web::test]
    async fn test_store_unavailable() {
        let store = TestStore::new();
        store.set_mode(Mode::Failing);

        let limiter = RateLimiter::builder(
            make_backend(&store),
            SimpleInputFunctionBuilder::new(MINUTE, 3).build(),
            FailurePolicy::Open,
        )
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;
        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let limiter = RateLimiter::builder(
            make_backend(&store),
            SimpleInputFunctionBuilder::new(MINUTE, 3).build(),
            FailurePolicy::Closed,
        )
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;
        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(response).await, DENIED_BODY);
    }

    #[actix_web::test]
    async fn test_store_timeout() {
        tokio::time::pause();
        let store = TestStore::new();
        store.set_mode(Mode::Hanging);
        let backend = SlidingWindowBackend::builder(store)
            .timeout(Duration::from_millis(100))
            .build();
        let limiter = RateLimiter::builder(
            backend,
            SimpleInputFunctionBuilder::new(MINUTE, 3).build(),
            FailurePolicy::Open,
        )
        .build();
        let app = test::init_service(App::new().service(route_api).wrap(limiter)).await;
        let response = test::call_service(&app, from_ip("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
