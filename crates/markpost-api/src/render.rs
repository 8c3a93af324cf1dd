//! Markdown to HTML, and the two pages the public side serves.

use pulldown_cmark::{Event, Options, Parser, html};

fn options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_FOOTNOTES
}

/// Renders CommonMark with raw HTML disabled: HTML blocks and inline tags
/// are emitted as escaped text.
pub fn markdown_to_html(markdown: &str) -> String {
    let parser = Parser::new_ext(markdown, options()).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    html::push_html(&mut out, std::iter::once(Event::Text(text.into())));
    out
}

const STYLE: &str = "body{max-width:48rem;margin:2rem auto;padding:0 1rem;\
font-family:system-ui,sans-serif;line-height:1.6}\
pre{overflow-x:auto;padding:.75rem;background:#f5f5f5}\
table{border-collapse:collapse}td,th{border:1px solid #ddd;padding:.25rem .5rem}";

fn page(title: &str, body_html: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
<title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n<article>\n\
<h1>{title}</h1>\n{body_html}</article>\n</body>\n</html>\n",
        title = escape(title),
    )
}

pub fn post_page(title: &str, markdown: &str) -> String {
    page(title, &markdown_to_html(markdown))
}

pub fn not_found_page() -> String {
    page("Post not found", "<p>This post does not exist or has expired.</p>\n")
}
