//! Turns composer text into outgoing event content.

use std::collections::BTreeSet;

use hicli_core::{
    BackendError, SendMessageParams,
    model::{Event, RelationType, event_type},
};
use pulldown_cmark::{Event as MdEvent, Options, Parser, Tag, html};
use serde_json::{Map, Value, json};

const HTML_FORMAT: &str = "org.matrix.custom.html";

/// Result of composing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Composed {
    Send {
        event_type: String,
        content: Value,
        /// Edits skip the per-room queue and wait for the server.
        synchronous: bool,
    },
    /// Client-only notice shown in the timeline. Nothing is sent.
    Notice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Body {
    msgtype: &'static str,
    text: String,
    formatted: Option<String>,
}

enum Directive {
    Message(Body),
    Raw { event_type: String, content: Value },
    Notice(String),
}

/// Render markdown to HTML. `None` when the text has no markup worth sending.
pub fn render_markdown(text: &str) -> Option<String> {
    let mut paragraphs = 0;
    let mut plain = true;
    for event in Parser::new_ext(text, Options::ENABLE_STRIKETHROUGH) {
        match event {
            MdEvent::Start(Tag::Paragraph) => paragraphs += 1,
            MdEvent::End(Tag::Paragraph) | MdEvent::Text(_) | MdEvent::SoftBreak => {}
            _ => plain = false,
        }
    }
    if plain && paragraphs <= 1 {
        return None;
    }

    let mut rendered = String::with_capacity(text.len() * 3 / 2);
    html::push_html(
        &mut rendered,
        Parser::new_ext(text, Options::ENABLE_STRIKETHROUGH),
    );
    let rendered = rendered.trim_end();
    if paragraphs == 1
        && let Some(inner) = rendered
            .strip_prefix("<p>")
            .and_then(|rest| rest.strip_suffix("</p>"))
        && !inner.contains("<p>")
    {
        return Some(inner.to_owned());
    }
    Some(rendered.to_owned())
}

fn markdown_body(msgtype: &'static str, text: &str) -> Body {
    Body {
        msgtype,
        text: text.to_owned(),
        formatted: render_markdown(text),
    }
}

fn parse_directive(text: &str) -> Directive {
    if let Some(escaped) = text.strip_prefix("//") {
        return Directive::Message(markdown_body("m.text", &format!("/{escaped}")));
    }
    let Some(command_line) = text.strip_prefix('/') else {
        return Directive::Message(markdown_body("m.text", text));
    };

    let (command, args) = command_line
        .split_once(char::is_whitespace)
        .map_or((command_line, ""), |(command, args)| (command, args.trim()));
    let command = command.to_ascii_lowercase();
    if !matches!(
        command.as_str(),
        "me" | "notice" | "plain" | "html" | "rawevent"
    ) {
        return Directive::Notice(format!("Unknown command /{command}"));
    }
    if args.is_empty() {
        return Directive::Notice(format!("Usage: /{command} <text>"));
    }

    match command.as_str() {
        "me" => Directive::Message(markdown_body("m.emote", args)),
        "notice" => Directive::Message(markdown_body("m.notice", args)),
        "plain" => Directive::Message(Body {
            msgtype: "m.text",
            text: args.to_owned(),
            formatted: None,
        }),
        "html" => Directive::Message(Body {
            msgtype: "m.text",
            text: args.to_owned(),
            formatted: Some(args.to_owned()),
        }),
        _ => parse_raw_event(args),
    }
}

fn parse_raw_event(args: &str) -> Directive {
    let Some((event_type, json_text)) = args.split_once(char::is_whitespace) else {
        return Directive::Notice("Usage: /rawevent <type> <json>".to_owned());
    };
    match serde_json::from_str::<Value>(json_text.trim()) {
        Ok(content @ Value::Object(_)) => Directive::Raw {
            event_type: event_type.to_owned(),
            content,
        },
        Ok(_) => Directive::Notice("Event content must be a JSON object".to_owned()),
        Err(err) => Directive::Notice(format!("Invalid JSON: {err}")),
    }
}

fn message_content(body: &Body) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("msgtype".to_owned(), json!(body.msgtype));
    content.insert("body".to_owned(), json!(body.text));
    if let Some(formatted) = &body.formatted {
        content.insert("format".to_owned(), json!(HTML_FORMAT));
        content.insert("formatted_body".to_owned(), json!(formatted));
    }
    content
}

fn mentions(
    params: &SendMessageParams,
    own_user_id: &str,
    reply_to: Option<&Event>,
) -> Value {
    let mut user_ids: BTreeSet<String> = params
        .mentions
        .iter()
        .flat_map(|mentions| mentions.user_ids.iter().cloned())
        .collect();
    if let Some(target) = reply_to
        && target.sender != own_user_id
        && !target.sender.is_empty()
    {
        user_ids.insert(target.sender.clone());
    }
    let mut value = json!({ "user_ids": user_ids });
    if params.mentions.as_ref().is_some_and(|mentions| mentions.room) {
        value["room"] = json!(true);
    }
    value
}

fn reply_relation(target: &Event) -> Value {
    let in_reply_to = json!({ "event_id": target.id });
    match (&target.relation_type, &target.relates_to) {
        (Some(RelationType::Thread), Some(thread_root)) => json!({
            "rel_type": "m.thread",
            "event_id": thread_root,
            "is_falling_back": false,
            "m.in_reply_to": in_reply_to,
        }),
        _ => json!({ "m.in_reply_to": in_reply_to }),
    }
}

/// Build the event for a composer submission.
///
/// `reply_to` and `edit_of` must be the resolved targets named in `params`.
pub fn compose(
    params: &SendMessageParams,
    own_user_id: &str,
    reply_to: Option<&Event>,
    edit_of: Option<&Event>,
) -> Result<Composed, BackendError> {
    let text = params.text.trim();
    if text.is_empty() {
        return Err(BackendError::invalid_command("message text is empty"));
    }
    if params.edit_of.is_some() && edit_of.is_none() {
        let target = params.edit_of.as_deref().unwrap_or_default();
        return Err(BackendError::event_not_found(target));
    }

    let body = match parse_directive(text) {
        Directive::Message(body) => body,
        Directive::Raw {
            event_type,
            content,
        } => {
            return Ok(Composed::Send {
                event_type,
                content,
                synchronous: false,
            });
        }
        Directive::Notice(notice) => return Ok(Composed::Notice(notice)),
    };

    let mentions = mentions(params, own_user_id, reply_to);
    let mut content = message_content(&body);
    if !params.link_previews.is_empty() {
        content.insert(
            "com.beeper.linkpreviews".to_owned(),
            Value::Array(params.link_previews.clone()),
        );
    }

    if let Some(target) = edit_of {
        let mut new_content = content.clone();
        new_content.insert("m.mentions".to_owned(), mentions.clone());
        content.insert("body".to_owned(), json!(format!("* {}", body.text)));
        if let Some(formatted) = &body.formatted {
            content.insert("formatted_body".to_owned(), json!(format!("* {formatted}")));
        }
        content.insert("m.new_content".to_owned(), Value::Object(new_content));
        content.insert(
            "m.relates_to".to_owned(),
            json!({ "rel_type": "m.replace", "event_id": target.id }),
        );
        content.insert("m.mentions".to_owned(), mentions);
        return Ok(Composed::Send {
            event_type: event_type::MESSAGE.to_owned(),
            content: Value::Object(content),
            synchronous: true,
        });
    }

    if let Some(target) = reply_to {
        content.insert("m.relates_to".to_owned(), reply_relation(target));
    }
    content.insert("m.mentions".to_owned(), mentions);
    Ok(Composed::Send {
        event_type: event_type::MESSAGE.to_owned(),
        content: Value::Object(content),
        synchronous: false,
    })
}

#[cfg(test)]
mod tests {
    use hicli_core::Mentions;

    use super::*;

    const ME: &str = "@me:example.org";

    fn params(text: &str) -> SendMessageParams {
        SendMessageParams {
            room_id: "!r:example.org".into(),
            text: text.into(),
            ..SendMessageParams::default()
        }
    }

    fn target(id: &str, sender: &str) -> Event {
        Event {
            id: id.into(),
            sender: sender.into(),
            event_type: event_type::MESSAGE.into(),
            content: json!({ "msgtype": "m.text", "body": "original" }),
            ..Event::default()
        }
    }

    fn sent_content(composed: Composed) -> (String, Value, bool) {
        match composed {
            Composed::Send {
                event_type,
                content,
                synchronous,
            } => (event_type, content, synchronous),
            Composed::Notice(notice) => panic!("unexpected notice: {notice}"),
        }
    }

    #[test]
    fn plain_text_has_no_formatted_body() {
        let (kind, content, synchronous) =
            sent_content(compose(&params("hello there"), ME, None, None).expect("should compose"));
        assert_eq!(kind, event_type::MESSAGE);
        assert!(!synchronous);
        assert_eq!(content["body"], "hello there");
        assert!(content.get("formatted_body").is_none());
        assert_eq!(content["m.mentions"], json!({ "user_ids": [] }));
    }

    #[test]
    fn markdown_renders_inline_html_without_paragraph_wrapper() {
        assert_eq!(
            render_markdown("some **bold** text").as_deref(),
            Some("some <strong>bold</strong> text")
        );
        let multi = render_markdown("one\n\ntwo").expect("two paragraphs are markup");
        assert_eq!(multi, "<p>one</p>\n<p>two</p>");
        assert_eq!(render_markdown("just words"), None);
    }

    #[test]
    fn emote_and_notice_commands_set_msgtype() {
        let (_, emote, _) = sent_content(compose(&params("/me waves"), ME, None, None).expect("emote"));
        assert_eq!(emote["msgtype"], "m.emote");
        assert_eq!(emote["body"], "waves");

        let (_, notice, _) =
            sent_content(compose(&params("/notice heads up"), ME, None, None).expect("notice"));
        assert_eq!(notice["msgtype"], "m.notice");
    }

    #[test]
    fn plain_and_html_commands_control_formatting() {
        let (_, plain, _) =
            sent_content(compose(&params("/plain **not bold**"), ME, None, None).expect("plain"));
        assert!(plain.get("formatted_body").is_none());

        let (_, raw_html, _) =
            sent_content(compose(&params("/html <b>hi</b>"), ME, None, None).expect("html"));
        assert_eq!(raw_html["formatted_body"], "<b>hi</b>");
        assert_eq!(raw_html["format"], HTML_FORMAT);
    }

    #[test]
    fn double_slash_escapes_commands() {
        let (_, content, _) =
            sent_content(compose(&params("//shrug"), ME, None, None).expect("escaped"));
        assert_eq!(content["body"], "/shrug");
    }

    #[test]
    fn rawevent_sends_arbitrary_content() {
        let (kind, content, _) = sent_content(
            compose(
                &params(r#"/rawevent com.example.ping {"n": 1}"#),
                ME,
                None,
                None,
            )
            .expect("raw event"),
        );
        assert_eq!(kind, "com.example.ping");
        assert_eq!(content, json!({ "n": 1 }));

        let notice = compose(&params("/rawevent com.example.ping {oops"), ME, None, None)
            .expect("invalid json still composes a notice");
        assert!(matches!(notice, Composed::Notice(text) if text.starts_with("Invalid JSON")));
    }

    #[test]
    fn unknown_command_becomes_local_notice() {
        let composed = compose(&params("/frobnicate now"), ME, None, None).expect("notice");
        assert_eq!(composed, Composed::Notice("Unknown command /frobnicate".into()));
    }

    #[test]
    fn reply_mentions_target_sender_and_keeps_thread() {
        let mut parent = target("$parent", "@bob:example.org");
        parent.relation_type = Some(RelationType::Thread);
        parent.relates_to = Some("$root".into());
        let mut request = params("sure");
        request.reply_to = Some("$parent".into());
        request.mentions = Some(Mentions {
            user_ids: vec!["@carol:example.org".into()],
            room: false,
        });

        let (_, content, _) =
            sent_content(compose(&request, ME, Some(&parent), None).expect("reply"));
        assert_eq!(
            content["m.mentions"]["user_ids"],
            json!(["@bob:example.org", "@carol:example.org"])
        );
        assert_eq!(content["m.relates_to"]["rel_type"], "m.thread");
        assert_eq!(content["m.relates_to"]["event_id"], "$root");
        assert_eq!(content["m.relates_to"]["m.in_reply_to"]["event_id"], "$parent");
    }

    #[test]
    fn edit_wraps_new_content_and_is_synchronous() {
        let original = target("$orig", ME);
        let mut request = params("fixed *typo*");
        request.edit_of = Some("$orig".into());

        let (_, content, synchronous) =
            sent_content(compose(&request, ME, None, Some(&original)).expect("edit"));
        assert!(synchronous);
        assert_eq!(content["body"], "* fixed *typo*");
        assert_eq!(content["formatted_body"], "* fixed <em>typo</em>");
        assert_eq!(content["m.new_content"]["body"], "fixed *typo*");
        assert_eq!(content["m.relates_to"]["rel_type"], "m.replace");
        assert_eq!(content["m.relates_to"]["event_id"], "$orig");
    }

    #[test]
    fn edit_of_unknown_event_is_rejected() {
        let mut request = params("fixed");
        request.edit_of = Some("$gone".into());
        let err = compose(&request, ME, None, None).expect_err("target is required");
        assert_eq!(err.code, "event_not_found");
    }

    #[test]
    fn link_previews_are_embedded() {
        let mut request = params("look https://example.org");
        request.link_previews = vec![json!({ "matched_url": "https://example.org" })];
        let (_, content, _) = sent_content(compose(&request, ME, None, None).expect("preview"));
        assert_eq!(
            content["com.beeper.linkpreviews"][0]["matched_url"],
            "https://example.org"
        );
    }
}
