use campaign_relay::config::TemplateConfig;
use campaign_relay::templates::dedup::{content_hash, normalize_text};
use campaign_relay::templates::namer::{generate_name, is_valid_name, NAME_MAX_LEN};
use campaign_relay::templates::validator::{count_urls, validate_text, TemplateRules, Violation};
use campaign_relay::types::{Body, Footer, Header, MediaFormat, TemplateContent};
use chrono::Utc;

fn content(body: &str) -> TemplateContent {
    TemplateContent::body_only(Body::new(body).unwrap())
}

#[test]
fn test_body_at_limit_is_valid() {
    let report = validate_text(&"a".repeat(1024), &TemplateRules::default());
    assert!(report.is_valid);
    assert!(report.errors.is_empty());
}

#[test]
fn test_body_over_limit_is_invalid() {
    let report = validate_text(&"a".repeat(1025), &TemplateRules::default());
    assert!(!report.is_valid);
    assert_eq!(report.violations, vec![Violation::TooLong { length: 1025, max: 1024 }]);
    assert!(report.errors[0].contains("1025"));
}

#[test]
fn test_every_violation_is_reported() {
    let text = format!(
        "Win the lottery! {} https://a.example https://b.example https://c.example www.d.example",
        "x".repeat(1024)
    );
    let report = validate_text(&text, &TemplateRules::default());
    assert_eq!(report.violations.len(), 3);
    assert!(report.violations.iter().any(|v| matches!(v, Violation::TooLong { .. })));
    assert!(report.violations.contains(&Violation::TooManyUrls { count: 4, max: 3 }));
    assert!(report.violations.contains(&Violation::DeniedTerm {
        term: "lottery".to_string()
    }));
}

#[test]
fn test_empty_text_is_invalid() {
    let report = validate_text("   \n ", &TemplateRules::default());
    assert_eq!(report.violations, vec![Violation::Empty]);
}

#[test]
fn test_denylist_matches_whole_words_only() {
    let rules = TemplateRules::default();
    assert!(validate_text("Visit our CASINO night", &rules).violations.len() == 1);
    assert!(validate_text("Casinos are closed", &rules).is_valid);
}

#[test]
fn test_extra_denylist_from_config() {
    let cfg = TemplateConfig {
        extra_denylist: vec!["  Crypto  ".to_string(), "".to_string()],
        ..TemplateConfig::default()
    };
    let rules = TemplateRules::from(&cfg);
    assert!(rules.denylist.contains(&"crypto".to_string()));
    assert!(!validate_text("Buy crypto today", &rules).is_valid);
}

#[test]
fn test_control_characters_are_flagged_but_newlines_allowed() {
    let rules = TemplateRules::default();
    assert!(validate_text("line one\nline two", &rules).is_valid);
    let report = validate_text("bell\u{7}", &rules);
    assert_eq!(report.violations, vec![Violation::ControlCharacter { codepoint: 7 }]);
}

#[test]
fn test_count_urls() {
    assert_eq!(count_urls("no links here"), 0);
    assert_eq!(count_urls("see https://shop.example/a?b=c and www.example.org"), 2);
}

#[test]
fn test_names_for_same_text_differ_and_are_valid() {
    let seed = Utc::now();
    let a = generate_name("Spring sale: 20% off!", seed);
    let b = generate_name("Spring sale: 20% off!", seed);
    assert_ne!(a, b);
    assert!(is_valid_name(&a));
    assert!(is_valid_name(&b));
    assert!(a.starts_with("spring_sale_20_off_"));
}

#[test]
fn test_long_and_symbolic_text_still_yields_valid_name() {
    let long = generate_name(&"word ".repeat(200), Utc::now());
    assert!(long.len() <= NAME_MAX_LEN);
    assert!(is_valid_name(&long));

    let symbols = generate_name("🎉🎉🎉", Utc::now());
    assert!(symbols.starts_with("tpl_"));
    assert!(is_valid_name(&symbols));
}

#[test]
fn test_is_valid_name_rejects_bad_input() {
    assert!(!is_valid_name(""));
    assert!(!is_valid_name("_leading"));
    assert!(!is_valid_name("Upper_case"));
    assert!(!is_valid_name("has-dash"));
    assert!(!is_valid_name(&"a".repeat(NAME_MAX_LEN + 1)));
}

#[test]
fn test_normalize_text() {
    assert_eq!(normalize_text("  Big   Spring\tSALE \n today "), "big spring sale today");
}

#[test]
fn test_content_hash_ignores_case_and_spacing() {
    assert_eq!(
        content_hash(&content("Big   Spring SALE today")),
        content_hash(&content("big spring sale TODAY"))
    );
    assert_ne!(content_hash(&content("Big sale")), content_hash(&content("Small sale")));
}

#[test]
fn test_content_hash_covers_header_and_footer() {
    let plain = content("Weekend deals");
    let mut with_footer = plain.clone();
    with_footer.footer = Some(Footer::new("Reply STOP to opt out").unwrap());
    assert_ne!(content_hash(&plain), content_hash(&with_footer));

    let mut image_a = plain.clone();
    image_a.header = Some(Header::media(MediaFormat::Image, "handle-a").unwrap());
    let mut image_b = plain.clone();
    image_b.header = Some(Header::media(MediaFormat::Image, "handle-b").unwrap());
    assert_eq!(content_hash(&image_a), content_hash(&image_b));
    assert_ne!(content_hash(&plain), content_hash(&image_a));
}
