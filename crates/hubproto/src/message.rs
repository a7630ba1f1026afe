//! Reply line parsing.
//!
//! A reply line is a whitespace separated header followed by a keyword body:
//!
//! ```text
//! Header: commander  cmdID  actor  msgCode
//! Body:   kw=v1, v2; kw2; kw3="quoted, with comma"
//! ```
//!
//! Quotes only open at the start of a token, so `SDSS u'` inside a double
//! quoted value (or an apostrophe in the middle of a bare word) never starts
//! a string. Inside quotes a backslash escapes the next character.

use serde::{Deserialize, Serialize};

use crate::cmdstr::quote_if_needed;
use crate::MsgType;

/// Errors while parsing a reply line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Missing {0} in reply header")]
    MissingField(&'static str),
    #[error("Invalid command id: {0:?}")]
    InvalidCmdId(String),
    #[error("Unknown message code: {0:?}")]
    UnknownMsgCode(String),
    #[error("Unterminated quote starting at byte {0}")]
    UnterminatedQuote(usize),
    #[error("Empty keyword name at byte {0}")]
    EmptyKeyword(usize),
}

/// One `keyword=value, value` group.
///
/// `None` marks a value the actor reported as unknown (`?` or `NaN`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub name: String,
    pub values: Vec<Option<String>>,
}

impl Keyword {
    pub fn new(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// A parsed reply from the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Commander that issued the command this replies to (`program.user`)
    pub commander: String,
    /// Command id assigned by that commander (0 for unsolicited output)
    pub cmd_id: u32,
    /// Actor that produced the reply
    pub actor: String,
    pub msg_type: MsgType,
    /// Keyword groups in wire order
    pub keywords: Vec<Keyword>,
}

impl Message {
    /// Parse one full reply line including the header.
    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let commander = next_field(&mut rest).ok_or(ParseError::MissingField("commander"))?;
        let id_str = next_field(&mut rest).ok_or(ParseError::MissingField("command id"))?;
        let cmd_id = id_str
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidCmdId(id_str.to_string()))?;
        let actor = next_field(&mut rest).ok_or(ParseError::MissingField("actor"))?;
        let code = next_field(&mut rest).ok_or(ParseError::MissingField("message code"))?;

        let mut code_chars = code.chars();
        let msg_type = match (code_chars.next(), code_chars.next()) {
            (Some(c), None) => MsgType::from_code(c)?,
            _ => return Err(ParseError::UnknownMsgCode(code.to_string())),
        };

        Ok(Self {
            commander: commander.to_string(),
            cmd_id,
            actor: actor.to_string(),
            msg_type,
            keywords: parse_keywords(rest)?,
        })
    }

    /// Build a message from a bare keyword body, as test harnesses do.
    pub fn from_body(
        actor: impl Into<String>,
        msg_type: MsgType,
        body: &str,
    ) -> Result<Self, ParseError> {
        Ok(Self {
            commander: "me".to_string(),
            cmd_id: 0,
            actor: actor.into(),
            msg_type,
            keywords: parse_keywords(body)?,
        })
    }

    /// Build a message carrying only a `text` keyword.
    pub fn with_text(
        commander: impl Into<String>,
        cmd_id: u32,
        actor: impl Into<String>,
        msg_type: MsgType,
        text: impl Into<String>,
    ) -> Self {
        Self {
            commander: commander.into(),
            cmd_id,
            actor: actor.into(),
            msg_type,
            keywords: vec![Keyword::new("text", vec![Some(text.into())])],
        }
    }

    pub fn keyword(&self, name: &str) -> Option<&Keyword> {
        self.keywords.iter().find(|k| k.name == name)
    }

    /// First value of the conventional `text` keyword.
    pub fn text(&self) -> Option<&str> {
        self.keyword("text")
            .and_then(|k| k.values.first())
            .and_then(|v| v.as_deref())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.commander, self.cmd_id, self.actor, self.msg_type
        )?;
        for (i, kw) in self.keywords.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { "; " })?;
            f.write_str(&kw.name)?;
            if kw.values.is_empty() {
                continue;
            }
            f.write_str("=")?;
            for (j, value) in kw.values.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                match value {
                    Some(v) => f.write_str(&quote_if_needed(v))?,
                    None => f.write_str("?")?,
                }
            }
        }
        Ok(())
    }
}

/// Split a keyword body into keyword groups.
pub fn parse_keywords(body: &str) -> Result<Vec<Keyword>, ParseError> {
    let mut keywords = Vec::new();
    for (offset, group) in split_unquoted(body, ';', 0)? {
        if group.trim().is_empty() {
            continue;
        }
        keywords.push(parse_group(group, offset)?);
    }
    Ok(keywords)
}

fn parse_group(group: &str, offset: usize) -> Result<Keyword, ParseError> {
    let eq = unquoted_positions(group, '=', offset)?.first().copied();
    let (name, values_str) = match eq {
        Some(pos) => (&group[..pos], Some(&group[pos + 1..])),
        None => (group, None),
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::EmptyKeyword(offset));
    }

    let values = match values_str {
        Some(s) if !s.trim().is_empty() => {
            let base = offset + name.len() + 1;
            split_unquoted(s, ',', base)?
                .into_iter()
                .map(|(_, token)| parse_token(token))
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(Keyword::new(name, values))
}

fn parse_token(token: &str) -> Option<String> {
    let t = token.trim();
    if let Some(q @ ('"' | '\'')) = t.chars().next() {
        if t.len() >= 2 && t.ends_with(q) {
            return Some(unescape(&t[1..t.len() - 1]));
        }
    }
    if t == "?" || t.eq_ignore_ascii_case("nan") {
        return None;
    }
    Some(t.to_string())
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let s = rest.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    let (field, tail) = s.split_at(end);
    *rest = tail;
    Some(field)
}

fn split_unquoted(s: &str, sep: char, base: usize) -> Result<Vec<(usize, &str)>, ParseError> {
    let mut parts = Vec::new();
    let mut start = 0;
    for pos in unquoted_positions(s, sep, base)? {
        parts.push((base + start, &s[start..pos]));
        start = pos + sep.len_utf8();
    }
    parts.push((base + start, &s[start..]));
    Ok(parts)
}

/// Byte offsets of `sep` that are not inside a quoted string.
fn unquoted_positions(s: &str, sep: char, base: usize) -> Result<Vec<usize>, ParseError> {
    let mut positions = Vec::new();
    let mut quote: Option<(char, usize)> = None;
    let mut escaped = false;
    let mut token_start = true;

    for (i, c) in s.char_indices() {
        if let Some((q, _)) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' if token_start => {
                quote = Some((c, i));
                token_start = false;
            }
            c if c == sep => {
                positions.push(i);
                token_start = true;
            }
            ',' | ';' | '=' => token_start = true,
            c if c.is_whitespace() => {}
            _ => token_start = false,
        }
    }

    match quote {
        Some((_, at)) => Err(ParseError::UnterminatedQuote(base + at)),
        None => Ok(positions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vals(kw: &Keyword) -> Vec<Option<&str>> {
        kw.values.iter().map(|v| v.as_deref()).collect()
    }

    #[test]
    fn parses_reply_header() {
        let msg = Message::parse_line("TU01.me 11 gifs : ccdTemp=250.1; heaterPower=12.3\r\n")
            .unwrap();
        assert_eq!(msg.commander, "TU01.me");
        assert_eq!(msg.cmd_id, 11);
        assert_eq!(msg.actor, "gifs");
        assert_eq!(msg.msg_type, MsgType::Done);
        assert_eq!(msg.keywords.len(), 2);
        assert_eq!(msg.keywords[0].name, "ccdTemp");
        assert_eq!(vals(&msg.keywords[1]), vec![Some("12.3")]);
    }

    #[test]
    fn header_without_body() {
        let msg = Message::parse_line(".hub 0 hub >").unwrap();
        assert_eq!(msg.msg_type, MsgType::Queued);
        assert!(msg.keywords.is_empty());
    }

    #[test]
    fn header_errors() {
        assert_eq!(
            Message::parse_line("TU01.me"),
            Err(ParseError::MissingField("command id"))
        );
        assert_eq!(
            Message::parse_line("TU01.me x gifs :"),
            Err(ParseError::InvalidCmdId("x".to_string()))
        );
        assert_eq!(
            Message::parse_line("TU01.me 1 gifs :: a=1"),
            Err(ParseError::UnknownMsgCode("::".to_string()))
        );
        assert_eq!(
            Message::parse_line("TU01.me 1 gifs"),
            Err(ParseError::MissingField("message code"))
        );
    }

    #[test]
    fn quoted_values_keep_commas_and_apostrophes() {
        let kws = parse_keywords(r#"filterNames="SDSS u'", "SDSS g'", clear; text="a; b=c""#)
            .unwrap();
        assert_eq!(kws.len(), 2);
        assert_eq!(
            vals(&kws[0]),
            vec![Some("SDSS u'"), Some("SDSS g'"), Some("clear")]
        );
        assert_eq!(vals(&kws[1]), vec![Some("a; b=c")]);
    }

    #[test]
    fn escapes_inside_quotes() {
        let kws = parse_keywords(r#"text="say \"hi\", ok""#).unwrap();
        assert_eq!(vals(&kws[0]), vec![Some(r#"say "hi", ok"#)]);
    }

    #[test]
    fn sentinels_become_absent() {
        let kws = parse_keywords("ccdTemp=?; focus=NaN, nan, 3.0; name=\"?\"").unwrap();
        assert_eq!(vals(&kws[0]), vec![None]);
        assert_eq!(vals(&kws[1]), vec![None, None, Some("3.0")]);
        // a quoted question mark is a real string
        assert_eq!(vals(&kws[2]), vec![Some("?")]);
    }

    #[test]
    fn keywords_without_values_and_empty_slots() {
        let kws = parse_keywords("moving; files=me, host, , file.fits").unwrap();
        assert_eq!(kws[0].name, "moving");
        assert!(kws[0].values.is_empty());
        assert_eq!(
            vals(&kws[1]),
            vec![Some("me"), Some("host"), Some(""), Some("file.fits")]
        );
    }

    #[test]
    fn apostrophe_mid_token_is_literal() {
        let kws = parse_keywords("filter=u', g'").unwrap();
        assert_eq!(vals(&kws[0]), vec![Some("u'"), Some("g'")]);
    }

    #[test]
    fn unterminated_quote_is_error() {
        assert!(matches!(
            parse_keywords(r#"text="never closed"#),
            Err(ParseError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn empty_keyword_name_is_error() {
        assert!(matches!(
            parse_keywords("a=1; =2"),
            Err(ParseError::EmptyKeyword(_))
        ));
    }

    #[test]
    fn trailing_separators_are_ignored() {
        let kws = parse_keywords(" a=1 ;; b=2; ").unwrap();
        assert_eq!(kws.len(), 2);
    }

    #[test]
    fn gifs_status_line() {
        let msg = Message::from_body(
            "gifs",
            MsgType::Information,
            "filterStatus=0, 4.0, -120000.0, halpha_a, 6564.0, 10.0, 0.0, 0.0",
        )
        .unwrap();
        assert_eq!(msg.keywords[0].values.len(), 8);
        assert_eq!(msg.keywords[0].values[3].as_deref(), Some("halpha_a"));
    }

    #[test]
    fn text_helper_and_display() {
        let msg = Message::with_text("TU01.me", 4, "tcc", MsgType::Error, "Timed out, sorry");
        assert_eq!(msg.text(), Some("Timed out, sorry"));
        let line = msg.to_string();
        assert_eq!(line, r#"TU01.me 4 tcc ! text="Timed out, sorry""#);
        assert_eq!(Message::parse_line(&line).unwrap(), msg);
    }

    #[test]
    fn serializes_to_json() {
        let msg = Message::from_body("tcc", MsgType::Warning, "AxePos=1.0, ?").unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["msg_type"], "warning");
        assert_eq!(json["keywords"][0]["values"][1], serde_json::Value::Null);
    }
}
