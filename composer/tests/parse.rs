use composer::{parse_template, CompositionError, TemplateEvent};
use tokio::io::BufReader;

use std::sync::Once;

static INIT: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
fn setup() {
    INIT.call_once(env_logger::init);
}

async fn collect(input: &str) -> Result<Vec<TemplateEvent>, CompositionError> {
    let mut events = Vec::new();
    parse_template(BufReader::new(input.as_bytes()), "fragment", |event| {
        events.push(event);
        Ok(())
    })
    .await?;
    Ok(events)
}

#[tokio::test]
async fn parse_basic_fragment() -> Result<(), CompositionError> {
    setup();

    let input = "<html><body><fragment src=\"https://example.com/hello\"/></body></html>";
    let events = collect(input).await?;

    let placeholder = events
        .iter()
        .find_map(|e| match e {
            TemplateEvent::FragmentPlaceholder { attrs, .. } => Some(attrs),
            _ => None,
        })
        .expect("fragment placeholder not found");

    assert_eq!(placeholder.get("src").map(String::as_str), Some("https://example.com/hello"));
    assert!(!placeholder.contains_key("primary"));

    Ok(())
}

#[tokio::test]
async fn parse_fragment_with_bare_boolean_attributes() -> Result<(), CompositionError> {
    setup();

    // `primary` and `async` carry no value, which strict XML attribute
    // parsing rejects; the template format allows it (spec §2).
    let input = r#"<fragment src="/2" primary async timeout="500"/>"#;
    let events = collect(input).await?;

    let placeholder = events
        .iter()
        .find_map(|e| match e {
            TemplateEvent::FragmentPlaceholder { attrs, .. } => Some(attrs),
            _ => None,
        })
        .expect("fragment placeholder not found");

    assert_eq!(placeholder.get("src").map(String::as_str), Some("/2"));
    assert_eq!(placeholder.get("primary").map(String::as_str), Some(""));
    assert_eq!(placeholder.get("async").map(String::as_str), Some(""));
    assert_eq!(placeholder.get("timeout").map(String::as_str), Some("500"));

    Ok(())
}

#[tokio::test]
async fn parse_open_fragment_tag_is_equivalent_to_self_closing() -> Result<(), CompositionError> {
    setup();

    let input = r#"<fragment id="f-1" src="/abc"></fragment>"#;
    let events = collect(input).await?;

    let placeholders: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, TemplateEvent::FragmentPlaceholder { .. }))
        .collect();

    assert_eq!(placeholders.len(), 1);

    Ok(())
}

#[tokio::test]
async fn parse_ignores_children_of_an_open_fragment_tag() -> Result<(), CompositionError> {
    setup();

    // Anything between `<fragment>` and `</fragment>` is not part of the
    // output: the fragment's own content comes from `src`, not the template.
    let input = r#"<fragment id="f-1" src="/abc"><p>ignored</p></fragment>"#;
    let events = collect(input).await?;

    let has_text_or_tags = events
        .iter()
        .any(|e| matches!(e, TemplateEvent::Text(_) | TemplateEvent::OpenTag { .. }));

    assert!(!has_text_or_tags);

    Ok(())
}

#[tokio::test]
async fn parse_case_insensitive_tag_name() -> Result<(), CompositionError> {
    setup();

    let input = "<FRAGMENT src=\"/abc\"/>";
    let events = collect(input).await?;

    assert!(events
        .iter()
        .any(|e| matches!(e, TemplateEvent::FragmentPlaceholder { .. })));

    Ok(())
}

#[tokio::test]
async fn parse_preserves_surrounding_markup_verbatim() -> Result<(), CompositionError> {
    setup();

    let input = "<html><body><h1>Title</h1><fragment src=\"/x\"/></body></html>";
    let events = collect(input).await?;

    let open_tags: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TemplateEvent::OpenTag { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();

    assert_eq!(open_tags, vec!["html", "body", "h1"]);

    Ok(())
}

#[tokio::test]
async fn parse_unexpected_closing_tag_is_an_error() {
    setup();

    let input = "</fragment>";
    let result = collect(input).await;

    assert!(matches!(result, Err(CompositionError::UnexpectedClosingTag(_))));
}

#[tokio::test]
async fn parse_multiple_fragments_in_order() -> Result<(), CompositionError> {
    setup();

    let input = r#"<fragment id="a" src="/a"/><fragment id="b" src="/b" primary/>"#;
    let events = collect(input).await?;

    let ids: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TemplateEvent::FragmentPlaceholder { attrs, .. } => attrs.get("id").cloned(),
            _ => None,
        })
        .collect();

    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

    Ok(())
}
