use crate::{Error, Result};

/// Maximum header lines accepted before the message is rejected outright.
pub const MAX_HEADER_LINES: usize = 1000;
/// Maximum comma separated value sets accepted in one field.
pub const MAX_VALUE_SETS: usize = 100;

/// A `;name=value` or bare `;name` parameter attached to a value set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parameter {
    pub name: String,
    pub value: Option<String>,
}

impl Parameter {
    pub fn flag(name: impl Into<String>) -> Self {
        Parameter {
            name: name.into(),
            value: None,
        }
    }

    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Parameter {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// One comma separated section of a field value: ordered words followed by
/// an ordered parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueSet {
    pub words: Vec<String>,
    pub parameters: Vec<Parameter>,
}

impl ValueSet {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// A header field in internal form: name plus one or more value sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value_sets: Vec<ValueSet>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Field {
            name: name.into(),
            value_sets: Vec::new(),
        }
    }

    /// Parser precondition shared by most fields: at least one value set
    /// whose first entry has at least one word.
    pub fn has_words(&self) -> bool {
        self.value_sets
            .first()
            .map(|set| !set.words.is_empty())
            .unwrap_or(false)
    }
}

/// Splits a raw header block into the first line and lexed fields.
///
/// Continuation lines (leading SP or HT) are folded into the previous line
/// before any field is lexed.
pub fn header_to_fields(header: &str) -> Result<(String, Vec<Field>)> {
    let mut lines: Vec<String> = Vec::new();
    for line in header.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match lines.last_mut() {
                Some(previous) => {
                    previous.push(' ');
                    previous.push_str(line.trim_start());
                    continue;
                }
                None => {
                    return Err(Error::MessageError(
                        "continuation line before any header line".to_string(),
                    ))
                }
            }
        }
        lines.push(line.to_string());
    }

    if lines.is_empty() {
        return Err(Error::MessageError("empty header".to_string()));
    }
    if lines.len() > MAX_HEADER_LINES {
        return Err(Error::MessageError(format!(
            "header has too many lines: {}",
            lines.len()
        )));
    }

    let first_line = lines.remove(0);
    let mut fields = Vec::with_capacity(lines.len());
    for line in &lines {
        fields.push(lex_field_line(line)?);
    }
    Ok((first_line, fields))
}

fn lex_field_line(line: &str) -> Result<Field> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::MessageError(format!("header line without colon: {}", line)))?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return Err(Error::MessageError(format!("bad field name in: {}", line)));
    }

    let mut field = Field::new(name);
    let sections = split_value_sets(value);
    if sections.len() > MAX_VALUE_SETS {
        return Err(Error::MessageError(format!(
            "too many value sets in field {}: {}",
            name,
            sections.len()
        )));
    }
    for section in sections {
        if let Some(set) = lex_value_set(section)? {
            field.value_sets.push(set);
        }
    }
    Ok(field)
}

/// Splits a field value on top level commas: commas inside double quotes,
/// angle brackets or parentheses do not separate value sets.
fn split_value_sets(value: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut in_quotes = false;
    let mut in_uri = false;
    let mut comment_depth = 0usize;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' if !in_uri => in_quotes = !in_quotes,
            '<' if !in_quotes && comment_depth == 0 => in_uri = true,
            '>' if !in_quotes && comment_depth == 0 => in_uri = false,
            '(' if !in_quotes && !in_uri => comment_depth += 1,
            ')' if !in_quotes && !in_uri && comment_depth > 0 => comment_depth -= 1,
            ',' if !in_quotes && !in_uri && comment_depth == 0 => {
                sections.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    sections.push(&value[start..]);
    sections.retain(|section| !section.trim().is_empty());
    sections
}

/// Character class state machine over one value set (RFC 3261 section 7.3).
///
/// Words keep their surrounding quotes and angle brackets so that a later
/// composer can reproduce the wire form; parenthesized comments are
/// discarded with nesting counted. Returns `None` for a set that ends up
/// with neither words nor parameters.
fn lex_value_set(text: &str) -> Result<Option<ValueSet>> {
    let mut set = ValueSet::default();
    let mut word = String::new();
    let mut in_quotes = false;
    let mut in_uri = false;
    let mut comment_depth = 0usize;
    let mut in_parameters = false;
    let mut parameter = Parameter::default();
    let mut have_parameter_name = false;

    let commit_word = |set: &mut ValueSet,
                       word: &mut String,
                       parameter: &mut Parameter,
                       have_name: bool,
                       in_parameters: bool| {
        if in_parameters {
            if have_name {
                if !word.is_empty() || parameter.value.is_none() {
                    parameter.value = Some(std::mem::take(word));
                }
            } else {
                parameter.name = std::mem::take(word);
            }
        } else if !word.is_empty() {
            set.words.push(std::mem::take(word));
        }
    };

    for c in text.chars() {
        if comment_depth > 0 {
            match c {
                '(' => comment_depth += 1,
                ')' => comment_depth -= 1,
                _ => {}
            }
            continue;
        }
        if in_quotes {
            word.push(c);
            if c == '"' {
                in_quotes = false;
                // a closing quote ends the word, as in `"Alice"<sip:a@b>`
                if !in_parameters {
                    commit_word(
                        &mut set,
                        &mut word,
                        &mut parameter,
                        have_parameter_name,
                        in_parameters,
                    );
                }
            }
            continue;
        }
        if in_uri {
            word.push(c);
            if c == '>' {
                in_uri = false;
                if !in_parameters {
                    commit_word(
                        &mut set,
                        &mut word,
                        &mut parameter,
                        have_parameter_name,
                        in_parameters,
                    );
                }
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                word.push(c);
            }
            '<' => {
                in_uri = true;
                word.push(c);
            }
            '(' => comment_depth = 1,
            ')' => {
                return Err(Error::MessageError(
                    "unbalanced comment parenthesis".to_string(),
                ))
            }
            ';' => {
                commit_word(
                    &mut set,
                    &mut word,
                    &mut parameter,
                    have_parameter_name,
                    in_parameters,
                );
                if in_parameters && !parameter.name.is_empty() {
                    set.parameters.push(std::mem::take(&mut parameter));
                }
                in_parameters = true;
                have_parameter_name = false;
            }
            '=' if in_parameters && !have_parameter_name => {
                parameter.name = std::mem::take(&mut word);
                have_parameter_name = true;
            }
            c if c.is_whitespace() => {
                commit_word(
                    &mut set,
                    &mut word,
                    &mut parameter,
                    have_parameter_name,
                    in_parameters,
                );
                if in_parameters && !parameter.name.is_empty() {
                    set.parameters.push(std::mem::take(&mut parameter));
                    have_parameter_name = false;
                }
            }
            c => word.push(c),
        }
    }

    if in_quotes {
        return Err(Error::MessageError("unterminated quoted string".to_string()));
    }
    if in_uri {
        return Err(Error::MessageError("unterminated angle bracket".to_string()));
    }
    if comment_depth > 0 {
        return Err(Error::MessageError("unterminated comment".to_string()));
    }

    commit_word(
        &mut set,
        &mut word,
        &mut parameter,
        have_parameter_name,
        in_parameters,
    );
    if in_parameters && !parameter.name.is_empty() {
        set.parameters.push(parameter);
    }

    if set.words.is_empty() && set.parameters.is_empty() {
        return Ok(None);
    }
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(line: &str) -> Field {
        lex_field_line(line).expect("lexes")
    }

    #[test]
    fn test_simple_field() {
        let field = lex("CSeq: 314159 INVITE");
        assert_eq!(field.name, "CSeq");
        assert_eq!(field.value_sets.len(), 1);
        assert_eq!(field.value_sets[0].words, vec!["314159", "INVITE"]);
    }

    #[test]
    fn test_parameters() {
        let field = lex("Via: SIP/2.0/TCP 192.0.2.1:5060;branch=z9hG4bK776asdhds;rport");
        let set = &field.value_sets[0];
        assert_eq!(set.words, vec!["SIP/2.0/TCP", "192.0.2.1:5060"]);
        assert_eq!(
            set.parameter("branch").unwrap().value.as_deref(),
            Some("z9hG4bK776asdhds")
        );
        assert!(set.parameter("rport").unwrap().value.is_none());
    }

    #[test]
    fn test_name_addr_keeps_quotes_and_brackets() {
        let field = lex("From: \"Alice Smith\" <sip:alice@example.test>;tag=88sja8x");
        let set = &field.value_sets[0];
        assert_eq!(set.words[0], "\"Alice Smith\"");
        assert_eq!(set.words[1], "<sip:alice@example.test>");
        assert_eq!(set.parameter("tag").unwrap().value.as_deref(), Some("88sja8x"));
    }

    #[test]
    fn test_uri_parameters_stay_inside_word() {
        let field = lex("Contact: <sip:u@192.0.2.10:5060;transport=tcp>;expires=3600");
        let set = &field.value_sets[0];
        assert_eq!(set.words[0], "<sip:u@192.0.2.10:5060;transport=tcp>");
        assert_eq!(set.parameter("expires").unwrap().value.as_deref(), Some("3600"));
    }

    #[test]
    fn test_top_level_comma_split() {
        let field = lex("Route: <sip:a.example.test;lr>, <sip:b.example.test;lr>");
        assert_eq!(field.value_sets.len(), 2);

        // a comma inside quotes is not a separator
        let field = lex("WWW-Authenticate: Digest realm=\"a,b\", nonce=\"xyz\"");
        assert_eq!(field.value_sets.len(), 2);
        assert_eq!(field.value_sets[0].words, vec!["Digest", "realm=\"a,b\""]);
        assert_eq!(field.value_sets[1].words, vec!["nonce=\"xyz\""]);
    }

    #[test]
    fn test_comments_discarded_with_nesting() {
        let field = lex("Subject: lunch (with (nested) aside) today");
        assert_eq!(field.value_sets[0].words, vec!["lunch", "today"]);
        assert!(lex_field_line("Subject: oops ) here").is_err());
    }

    #[test]
    fn test_line_folding() {
        let folded = "INVITE sip:bob@example.test SIP/2.0\r\nSubject: I know you're\r\n there\r\n";
        let plain = "INVITE sip:bob@example.test SIP/2.0\r\nSubject: I know you're there\r\n";
        let (_, folded_fields) = header_to_fields(folded).unwrap();
        let (_, plain_fields) = header_to_fields(plain).unwrap();
        assert_eq!(folded_fields, plain_fields);
    }

    #[test]
    fn test_empty_value_set_dropped() {
        let field = lex("Accept: application/sdp, ,");
        assert_eq!(field.value_sets.len(), 1);
    }
}
