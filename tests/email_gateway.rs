use bullhorn::email::{EmailQueue, EmailRecipient, EmailSender, HttpEmailGateway};
use bullhorn::models::Priority;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn one_recipient() -> Vec<EmailRecipient> {
    vec![EmailRecipient { email: "alice@x.io".into(), name: "alice".into() }]
}

#[tokio::test]
async fn queue_broadcast_parses_gateway_receipt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"queued": true})))
        .expect(1)
        .mount(&server)
        .await;

    let gw = HttpEmailGateway::new(server.uri());
    let receipt = gw
        .queue_broadcast(&one_recipient(), "t", "c", Priority::High, &serde_json::json!({}))
        .await;
    assert!(receipt.queued);
    assert!(receipt.error.is_none());
}

#[tokio::test]
async fn queue_failure_surfaces_the_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gw = HttpEmailGateway::new(server.uri());
    let receipt = gw
        .queue_broadcast(&one_recipient(), "t", "c", Priority::High, &serde_json::json!({}))
        .await;
    assert!(!receipt.queued);
    assert!(receipt.error.unwrap().contains("500"));
}

#[tokio::test]
async fn send_failure_sets_last_error_and_success_clears_it() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;

    let gw = HttpEmailGateway::new(failing.uri());
    assert!(!gw.send_broadcast(&one_recipient(), "t", "c", Priority::Urgent).await);
    assert!(gw.last_error().unwrap().contains("503"));

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let gw = HttpEmailGateway::new(healthy.uri());
    assert!(gw.send_broadcast(&one_recipient(), "t", "c", Priority::Urgent).await);
    assert!(gw.last_error().is_none());
}
