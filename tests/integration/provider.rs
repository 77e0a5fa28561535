use bytes::Bytes;
use campaign_relay::channels::whatsapp::WhatsAppProvider;
use campaign_relay::channels::{MessagingProvider, ProviderError, TemplateSubmission};
use campaign_relay::config::ProviderConfig;
use campaign_relay::types::{MediaFormat, SendParameters};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> WhatsAppProvider {
    let config = ProviderConfig {
        api_base: server.uri(),
        phone_number_id: Some("1100".to_string()),
        business_account_id: Some("waba-9".to_string()),
        access_token: Some("secret-token".to_string()),
        ..ProviderConfig::default()
    };
    WhatsAppProvider::new(reqwest::Client::new(), config)
}

#[tokio::test]
async fn test_send_text_returns_message_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v19.0/1100/messages"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_partial_json(json!({
            "to": "15550100",
            "type": "text",
            "text": {"body": "hello"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messaging_product": "whatsapp",
            "contacts": [{"input": "15550100", "wa_id": "15550100"}],
            "messages": [{"id": "wamid.HBgL"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let id = provider(&server).send_text("15550100", "hello").await.unwrap();
    assert_eq!(id, "wamid.HBgL");
}

#[tokio::test]
async fn test_send_template_carries_header_media() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v19.0/1100/messages"))
        .and(body_partial_json(json!({
            "type": "template",
            "template": {
                "name": "spring_sale_ab12cd34_1",
                "language": {"code": "en_US"},
                "components": [{
                    "type": "header",
                    "parameters": [{"type": "image", "image": {"id": "media-7"}}]
                }]
            }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"messages": [{"id": "wamid.T1"}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let params = SendParameters {
        header_media: Some((MediaFormat::Image, "media-7".to_string())),
    };
    let id = provider(&server)
        .send_template("15550100", "spring_sale_ab12cd34_1", "en_US", &params)
        .await
        .unwrap();
    assert_eq!(id, "wamid.T1");
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v19.0/1100/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let err = provider(&server).send_text("15550100", "hi").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_client_error_is_rejection_with_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v19.0/1100/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message": "(#131047) Re-engagement message",
                "type": "OAuthException",
                "code": 131047
            }
        })))
        .mount(&server)
        .await;

    let err = provider(&server).send_text("15550100", "hi").await.unwrap_err();
    assert_eq!(
        err,
        ProviderError::Rejected {
            code: Some(131047),
            message: "(#131047) Re-engagement message".to_string(),
        }
    );
}

#[tokio::test]
async fn test_submit_template_posts_components() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v19.0/waba-9/message_templates"))
        .and(body_partial_json(json!({
            "name": "welcome_1",
            "category": "MARKETING",
            "language": "en_US"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "594425479261596", "status": "PENDING", "category": "MARKETING"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let submission = TemplateSubmission {
        name: "welcome_1".to_string(),
        category: "MARKETING".to_string(),
        language: "en_US".to_string(),
        components: json!([{"type": "BODY", "text": "Welcome aboard"}]),
    };
    let id = provider(&server).submit_template(&submission).await.unwrap();
    assert_eq!(id, "594425479261596");
}

#[tokio::test]
async fn test_list_templates_follows_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v19.0/waba-9/message_templates"))
        .and(query_param("after", "CURSOR1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "2",
                "name": "second",
                "status": "REJECTED",
                "rejected_reason": "PROMOTIONAL"
            }],
            "paging": {"cursors": {"before": "CURSOR1", "after": "CURSOR2"}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v19.0/waba-9/message_templates"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "1", "name": "first", "status": "APPROVED", "language": "en_US"}],
            "paging": {
                "cursors": {"before": "CURSOR0", "after": "CURSOR1"},
                "next": "https://graph/next"
            }
        })))
        .mount(&server)
        .await;

    let provider = provider(&server);
    let first = provider.list_templates(None).await.unwrap();
    assert_eq!(first.templates[0].name, "first");
    assert_eq!(first.after.as_deref(), Some("CURSOR1"));

    let second = provider.list_templates(first.after.as_deref()).await.unwrap();
    assert_eq!(second.templates[0].rejected_reason.as_deref(), Some("PROMOTIONAL"));
    assert!(second.after.is_none());
}

#[tokio::test]
async fn test_delete_template_by_name() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v19.0/waba-9/message_templates"))
        .and(query_param("name", "unused_tpl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server).delete_template("unused_tpl").await.unwrap();
}

#[tokio::test]
async fn test_fetch_then_upload_media() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/assets/banner.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG-data".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v19.0/1100/media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "media-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server);
    let bytes = provider
        .fetch_media(&format!("{}/assets/banner.png", server.uri()))
        .await
        .unwrap();
    assert_eq!(bytes, Bytes::from_static(b"\x89PNG-data"));
    let id = provider.upload_media(bytes, "image/png").await.unwrap();
    assert_eq!(id, "media-42");
}

#[tokio::test]
async fn test_missing_media_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/assets/gone.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = provider(&server)
        .fetch_media(&format!("{}/assets/gone.png", server.uri()))
        .await
        .unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_unconfigured_sender_is_rejected_without_a_request() {
    let server = MockServer::start().await;
    let config = ProviderConfig {
        api_base: server.uri(),
        ..ProviderConfig::default()
    };
    let err = WhatsAppProvider::new(reqwest::Client::new(), config)
        .send_text("15550100", "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Rejected { code: None, .. }));
}
