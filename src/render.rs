//! Record rendering.
//!
//! The export engine treats rendering as an opaque `record -> fragment`
//! function behind the [`Render`] trait. [`HtmlRenderer`] is the default
//! implementation: a total match over the closed [`Element`] set that emits
//! small HTML fragments pointing at the bundle's `resources/` tree.

use crate::models::{sanitize_file_name, Element, Record, ResourceKind};

/// Turns one record into the fragment stored in its shard.
pub trait Render: Send + Sync {
    fn render(&self, record: &Record) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlRenderer;

impl Render for HtmlRenderer {
    fn render(&self, record: &Record) -> String {
        if let Some(body) = &record.rendered_body {
            return body.clone();
        }
        let mut out = String::new();
        for element in &record.elements {
            render_element(element, &mut out);
        }
        out
    }
}

fn render_element(element: &Element, out: &mut String) {
    match element {
        Element::Text { text } => {
            out.push_str(&escape_html(text).replace('\n', "<br>"));
        }
        Element::Image {
            file_name, summary, ..
        } => {
            out.push_str(&format!(
                r#"<img class="msg-image" loading="lazy" src="{}" alt="{}">"#,
                resource_src(ResourceKind::Image, file_name),
                escape_html(summary.as_deref().unwrap_or("image"))
            ));
        }
        Element::Audio { file_name, .. } => {
            out.push_str(&format!(
                r#"<audio class="msg-audio" controls preload="none" src="{}"></audio>"#,
                resource_src(ResourceKind::Audio, file_name)
            ));
        }
        Element::Video { file_name, .. } => {
            out.push_str(&format!(
                r#"<video class="msg-video" controls preload="none" src="{}"></video>"#,
                resource_src(ResourceKind::Video, file_name)
            ));
        }
        Element::File { file_name, .. } => {
            out.push_str(&format!(
                r#"<a class="msg-file" href="{}" download>{}</a>"#,
                resource_src(ResourceKind::File, file_name),
                escape_html(file_name)
            ));
        }
        Element::Face { id, name } => {
            out.push_str(&format!(
                r#"<span class="msg-face" data-face="{}">[{}]</span>"#,
                escape_html(id),
                escape_html(name.as_deref().unwrap_or("face"))
            ));
        }
        Element::MarketFace { name, url } => match url {
            Some(url) => out.push_str(&format!(
                r#"<img class="msg-sticker" loading="lazy" src="{}" alt="{}">"#,
                escape_html(url),
                escape_html(name)
            )),
            None => out.push_str(&format!(
                r#"<span class="msg-sticker">[{}]</span>"#,
                escape_html(name)
            )),
        },
        Element::Reply { target_id, preview } => {
            // The viewer resolves data-reply-to through the identifier index.
            out.push_str(&format!(
                r#"<a class="msg-reply" data-reply-to="{}">{}</a>"#,
                escape_html(target_id),
                escape_html(preview.as_deref().unwrap_or(""))
            ));
        }
        Element::Json { payload, title } => {
            out.push_str(&format!(
                r#"<div class="msg-card" data-payload="{}">{}</div>"#,
                escape_html(payload),
                escape_html(title.as_deref().unwrap_or("card"))
            ));
        }
        Element::Forward { summary, count } => {
            out.push_str(&format!(
                r#"<div class="msg-forward">{} ({})</div>"#,
                escape_html(summary.as_deref().unwrap_or("forwarded messages")),
                count
            ));
        }
        Element::System { text } => {
            out.push_str(&format!(
                r#"<div class="msg-system">{}</div>"#,
                escape_html(text)
            ));
        }
        Element::Location { lat, lon, title } => {
            out.push_str(&format!(
                r#"<a class="msg-location" href="geo:{},{}">{}</a>"#,
                lat,
                lon,
                escape_html(title.as_deref().unwrap_or("location"))
            ));
        }
        Element::Unknown { raw } => {
            out.push_str(&format!(
                r#"<span class="msg-unknown">{}</span>"#,
                escape_html(raw)
            ));
        }
    }
}

fn resource_src(kind: ResourceKind, file_name: &str) -> String {
    match sanitize_file_name(file_name) {
        Some(name) => escape_html(&format!("resources/{}/{}", kind.dir_name(), name)),
        None => String::new(),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(elements: Vec<Element>) -> Record {
        Record {
            id: Some("1".to_string()),
            timestamp: 0,
            sender_id: "u".to_string(),
            sender_name: "U".to_string(),
            elements,
            rendered_body: None,
        }
    }

    #[test]
    fn text_is_escaped() {
        let html = HtmlRenderer.render(&record(vec![Element::Text {
            text: "<b>hi</b>\nthere".to_string(),
        }]));
        assert_eq!(html, "&lt;b&gt;hi&lt;/b&gt;<br>there");
    }

    #[test]
    fn resources_point_into_bundle() {
        let html = HtmlRenderer.render(&record(vec![
            Element::Image {
                file_name: "dir/pic.png".to_string(),
                source: None,
                summary: None,
            },
            Element::File {
                file_name: "a&b.zip".to_string(),
                source: None,
                size: Some(3),
            },
        ]));
        assert!(html.contains(r#"src="resources/images/pic.png""#));
        assert!(html.contains(r#"href="resources/files/a&amp;b.zip""#));
    }

    #[test]
    fn reply_carries_target_id() {
        let html = HtmlRenderer.render(&record(vec![Element::Reply {
            target_id: "m-42".to_string(),
            preview: Some("earlier".to_string()),
        }]));
        assert!(html.contains(r#"data-reply-to="m-42""#));
    }

    #[test]
    fn rendered_body_overrides_elements() {
        let mut r = record(vec![Element::Text {
            text: "ignored".to_string(),
        }]);
        r.rendered_body = Some("<p>custom</p>".to_string());
        assert_eq!(HtmlRenderer.render(&r), "<p>custom</p>");
    }
}
