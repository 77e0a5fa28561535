use campaign_relay::types::{
    Body, Button, Buttons, CampaignStatus, ComponentError, DeliveryStatus, Header,
    HeaderMediaSpec, MediaFormat, MessageStatus, SendParameters, SendPath, TemplateComponent,
    TemplateContent, TemplateStatus, HEADER_TEXT_MAX,
};

#[test]
fn test_status_text_values() {
    assert_eq!(SendPath::Free.as_str(), "free");
    assert_eq!(SendPath::parse("template"), Some(SendPath::Template));
    assert_eq!(CampaignStatus::AwaitingTemplate.to_string(), "awaiting_template");
    assert_eq!(serde_json::to_string(&MessageStatus::Queued).unwrap(), "\"queued\"");
    assert_eq!(serde_json::to_string(&TemplateStatus::Pending).unwrap(), "\"PENDING\"");
}

#[test]
fn test_delivery_status_maps_to_message_status() {
    assert_eq!(DeliveryStatus::Read.as_message_status(), MessageStatus::Read);
    assert_eq!(DeliveryStatus::Failed.as_message_status(), MessageStatus::Failed);
    assert!(MessageStatus::Read.rank() > MessageStatus::Delivered.rank());
    assert!(MessageStatus::Delivered.rank() > MessageStatus::Sent.rank());
}

#[test]
fn test_template_status_from_provider() {
    assert_eq!(TemplateStatus::from_provider("APPROVED"), TemplateStatus::Approved);
    assert_eq!(TemplateStatus::from_provider(" rejected "), TemplateStatus::Rejected);
    assert_eq!(TemplateStatus::from_provider("PAUSED"), TemplateStatus::Pending);
    assert!(TemplateStatus::Approved.is_terminal());
    assert!(!TemplateStatus::Pending.is_terminal());
}

#[test]
fn test_media_format_from_mime() {
    assert_eq!(MediaFormat::from_mime("image/jpeg"), MediaFormat::Image);
    assert_eq!(MediaFormat::from_mime("VIDEO/mp4"), MediaFormat::Video);
    assert_eq!(MediaFormat::from_mime("application/pdf"), MediaFormat::Document);
    assert_eq!(MediaFormat::Document.send_key(), "document");
}

#[test]
fn test_component_constructors_validate() {
    assert_eq!(Body::new("   "), Err(ComponentError::Empty("body")));
    assert_eq!(Body::new("  hi  ").unwrap().text(), "hi");
    assert!(matches!(
        Header::text(&"h".repeat(HEADER_TEXT_MAX + 1)),
        Err(ComponentError::TooLong { kind: "header", .. })
    ));
    assert_eq!(Button::url("Shop", "shop.example"), Err(ComponentError::InvalidUrl));
    assert!(Button::phone_number("Call us", "+15550100").is_ok());
}

#[test]
fn test_media_header_creation_json() {
    let header = Header::media(MediaFormat::Video, "4::dmlkZW8=").unwrap();
    let json = TemplateComponent::Header(header).to_creation_json();
    assert_eq!(json["format"], "VIDEO");
    assert_eq!(json["example"]["header_handle"][0], "4::dmlkZW8=");
}

#[test]
fn test_body_only_content_json() {
    let content = TemplateContent::body_only(Body::new("Thanks for visiting").unwrap());
    let json = content.creation_json();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["type"], "BODY");
    assert_eq!(json[0]["text"], "Thanks for visiting");
}

#[test]
fn test_buttons_json() {
    let buttons = Buttons::new(vec![
        Button::quick_reply("Yes").unwrap(),
        Button::phone_number("Call", "15550100").unwrap(),
    ])
    .unwrap();
    let json = TemplateComponent::Buttons(buttons).to_creation_json();
    assert_eq!(json["buttons"][0]["type"], "QUICK_REPLY");
    assert_eq!(json["buttons"][1]["phone_number"], "15550100");
}

#[test]
fn test_send_parameters_document_header() {
    let params = SendParameters {
        header_media: Some((MediaFormat::Document, "media-9".to_string())),
    };
    let json = params.to_json();
    assert_eq!(json[0]["type"], "header");
    assert_eq!(json[0]["parameters"][0]["type"], "document");
    assert_eq!(json[0]["parameters"][0]["document"]["id"], "media-9");
}

#[test]
fn test_header_media_spec_deserializes() {
    let raw = r#"{"url": "https://cdn.example/a.pdf", "mime_type": "application/pdf"}"#;
    let spec: HeaderMediaSpec = serde_json::from_str(raw).unwrap();
    assert_eq!(spec.url, "https://cdn.example/a.pdf");
}
