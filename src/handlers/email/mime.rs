use super::{EmailAttachment, OutgoingEmail};
use crate::definition::EmailBodyFormat;
use base64::Engine as _;

const LINE_WIDTH: usize = 76;

fn encode_wrapped(data: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH * 2);
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn header_text(value: &str) -> String {
    if value.is_ascii() {
        return value.replace(['\r', '\n'], " ");
    }
    format!(
        "=?UTF-8?B?{}?=",
        base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
    )
}

fn quoted_filename(name: &str) -> String {
    name.replace(['"', '\\', '\r', '\n'], "_")
}

fn push_attachment(out: &mut String, boundary: &str, attachment: &EmailAttachment) {
    let name = quoted_filename(&attachment.filename);
    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str(&format!(
        "Content-Type: {}; name=\"{name}\"\r\n",
        attachment.content_type
    ));
    out.push_str(&format!(
        "Content-Disposition: attachment; filename=\"{name}\"\r\n"
    ));
    out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    out.push_str(&encode_wrapped(&attachment.data));
}

/// Builds a `multipart/mixed` message: one body part followed by one part
/// per attachment. Bcc recipients never appear in the headers.
pub fn build_raw_message(email: &OutgoingEmail, boundary: &str) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("From: {}\r\n", header_text(&email.from)));
    out.push_str(&format!("To: {}\r\n", header_text(&email.to.join(", "))));
    if !email.cc.is_empty() {
        out.push_str(&format!("Cc: {}\r\n", header_text(&email.cc.join(", "))));
    }
    if !email.reply_to.is_empty() {
        out.push_str(&format!(
            "Reply-To: {}\r\n",
            header_text(&email.reply_to.join(", "))
        ));
    }
    out.push_str(&format!("Subject: {}\r\n", header_text(&email.subject)));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
    ));

    let body_type = match email.body_format {
        EmailBodyFormat::Text => "text/plain",
        EmailBodyFormat::Html => "text/html",
    };
    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str(&format!("Content-Type: {body_type}; charset=UTF-8\r\n"));
    out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    out.push_str(&encode_wrapped(email.body.as_bytes()));

    for attachment in &email.attachments {
        push_attachment(&mut out, boundary, attachment);
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out.into_bytes()
}
