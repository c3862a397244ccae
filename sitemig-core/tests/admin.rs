use sitemig_core::{AdminClient, AdminError, AdminOperation, SiteRef};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn site() -> SiteRef {
    SiteRef {
        owner: "acme".into(),
        repo: "website".into(),
        branch: "main".into(),
    }
}

#[tokio::test]
async fn invoke_posts_to_operation_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/preview/acme/website/main/en/about"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&server)
        .await;

    let client = AdminClient::with_base_url(&server.uri(), site()).unwrap();
    let response = client
        .invoke(AdminOperation::Preview, "/en/about")
        .await
        .unwrap();

    assert!(response.ok());
    assert_eq!(response.body, "{\"ok\":true}");
}

#[tokio::test]
async fn invoke_reports_failure_status_without_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status/acme/website/main/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = AdminClient::with_base_url(&server.uri(), site()).unwrap();
    let response = client
        .invoke(AdminOperation::Status, "missing")
        .await
        .unwrap();

    assert!(!response.ok());
    assert_eq!(response.status.as_u16(), 404);
}

#[tokio::test]
async fn run_classifies_service_unavailable_as_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/live/acme/website/main/index"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = AdminClient::with_base_url(&server.uri(), site()).unwrap();
    let err = client
        .run(AdminOperation::Live, "/index")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AdminError::Api {
            operation: AdminOperation::Live,
            ..
        }
    ));
    assert!(err.is_retryable());
}
