//! Django template syntax on top of Tera.
//!
//! Custom templates are written in Django's template language, which mostly overlaps with Tera's.
//! The parts that don't are rewritten before Tera sees the source:
//!
//! - `{{ x|default:'y' }}` becomes `{{ x| fallback(value='y') }}`. Tera's own `default` only
//!   fires for undefined values, while Django's fires for anything falsy.
//! - `forloop.counter` and friends become `loop.index` and friends.
//!
//! Undefined variables render as nothing in Django, but are errors in Tera. Two things bridge
//! that. Output tags that print a variable get a leading `default(value="")`, the one Tera filter
//! that accepts undefined values; this covers fields of loop items. The variables a template
//! refers to are also collected, so that missing ones can be filled in with empty values before
//! rendering, which covers conditions, loops, and filter arguments.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Words that can appear in an expression without being variables.
const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "true", "false", "True", "False", "none", "None",
];

/// Rewrites Django-only syntax into its Tera equivalent. Text outside tags is untouched.
pub fn translate(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for segment in segments(src) {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Expr(inner) => {
                out.push_str("{{");
                out.push_str(&guard(&rewrite(inner)));
                out.push_str("}}");
            }
            Segment::Tag(inner) => {
                out.push_str("{%");
                out.push_str(&rewrite(inner));
                out.push_str("%}");
            }
            Segment::Comment(inner) => {
                out.push_str("{#");
                out.push_str(inner);
                out.push_str("#}");
            }
        }
    }
    out
}

/// A variable path used by a template, e.g. `["user", "name"]` for `{{ user.name }}`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Reference {
    path: Vec<String>,

    /// Whether the variable is looped over, and so should default to an empty list.
    iterable: bool,
}

/// The variables a template refers to.
#[derive(Clone, Debug, Default)]
pub struct References {
    refs: Vec<Reference>,
    locals: BTreeSet<String>,
}

impl References {
    /// Scans (already translated) template source.
    pub fn scan(src: &str) -> References {
        let mut refs = References::default();
        for segment in segments(src) {
            match segment {
                Segment::Expr(inner) => refs.expr(trim_tag(inner), false),
                Segment::Tag(inner) => refs.tag(trim_tag(inner)),
                Segment::Text(_) | Segment::Comment(_) => {}
            }
        }
        refs
    }

    /// Adds the references of another template.
    pub fn extend(&mut self, other: References) {
        self.refs.extend(other.refs);
        self.locals.extend(other.locals);
    }

    /// The top-level names that would be looked up in the context.
    pub fn names(&self) -> BTreeSet<&str> {
        self.globals()
            .filter_map(|r| r.path.first())
            .map(String::as_str)
            .collect()
    }

    /// Returns a copy of `supplied` where every referenced variable is defined, missing ones
    /// being empty strings (or empty lists, if looped over).
    ///
    /// Loop variables are filled too: a name can be a loop variable in one place and a context
    /// variable in another, and inside the loop the loop's value shadows the filled one.
    pub fn fill(&self, supplied: &Map<String, Value>) -> Map<String, Value> {
        let mut context = supplied.clone();
        let mut refs = self
            .refs
            .iter()
            .filter(|r| r.path.first().map_or(false, |root| root != "loop"))
            .collect::<Vec<_>>();
        refs.sort_by_key(|r| !r.iterable);
        for r in refs {
            let leaf = if r.iterable {
                Value::Array(Vec::new())
            } else {
                Value::String(String::new())
            };
            fill_path(&mut context, &r.path, leaf);
        }
        context
    }

    fn globals(&self) -> impl Iterator<Item = &Reference> {
        self.refs.iter().filter(move |r| match r.path.first() {
            Some(root) => root != "loop" && !self.locals.contains(root),
            None => false,
        })
    }

    fn tag(&mut self, tag: &str) {
        let (keyword, rest) = match tag.find(char::is_whitespace) {
            Some(idx) => (&tag[..idx], tag[idx..].trim()),
            None => (tag, ""),
        };
        match keyword {
            "if" | "elif" => self.expr(rest, false),
            "for" => {
                if let Some((vars, iterable)) = rest.split_once(" in ") {
                    for var in vars.split(',') {
                        self.locals.insert(var.trim().to_string());
                    }
                    self.expr(iterable, true);
                }
            }
            "set" | "set_global" => {
                if let Some((name, value)) = rest.split_once('=') {
                    self.locals.insert(name.trim().to_string());
                    self.expr(value, false);
                }
            }
            _ => {}
        }
    }

    fn expr(&mut self, expr: &str, iterable: bool) {
        let tokens = lex(expr)
            .into_iter()
            .filter(|t| !matches!(t, Token::Space(_)))
            .collect::<Vec<_>>();

        let mut iterable = iterable;
        let mut after_is = false;
        for (i, token) in tokens.iter().enumerate() {
            let name = match *token {
                Token::Ident(name) => name,
                _ => {
                    after_is = false;
                    continue;
                }
            };
            if KEYWORDS.contains(&name) {
                after_is = name == "is" || (after_is && name == "not");
                continue;
            }
            if after_is {
                // A test, as in `x is defined`.
                after_is = false;
                continue;
            }

            let prev = i.checked_sub(1).and_then(|j| tokens.get(j));
            let next = tokens.get(i + 1);
            let is_filter = prev == Some(&Token::Punct("|"));
            let is_call = next == Some(&Token::Punct("("));
            let is_kwarg =
                next == Some(&Token::Punct("=")) && tokens.get(i + 2) != Some(&Token::Punct("="));
            if is_filter || is_call || is_kwarg {
                continue;
            }

            let path = name
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            if !path.is_empty() {
                self.refs.push(Reference { path, iterable });
                iterable = false;
            }
        }
    }
}

fn fill_path(map: &mut Map<String, Value>, path: &[String], leaf: Value) {
    let (head, tail) = match path.split_first() {
        Some(split) => split,
        None => return,
    };
    if tail.is_empty() {
        map.entry(head.clone()).or_insert(leaf);
        return;
    }
    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(child) = child {
        fill_path(child, tail, leaf);
    }
}

/// Strips whitespace and Tera's whitespace-control dashes from the inside of a tag.
fn trim_tag(inner: &str) -> &str {
    inner.trim().trim_matches('-').trim()
}

fn loop_alias(name: &str) -> Option<&'static str> {
    match name {
        "forloop.counter" => Some("loop.index"),
        "forloop.counter0" => Some("loop.index0"),
        "forloop.first" => Some("loop.first"),
        "forloop.last" => Some("loop.last"),
        _ => None,
    }
}

/// Rewrites the inside of a `{{ }}` or `{% %}`.
fn rewrite(expr: &str) -> String {
    let tokens = lex(expr);
    let mut out = String::with_capacity(expr.len() + 16);
    let mut i = 0;
    while let Some(token) = tokens.get(i) {
        match *token {
            Token::Punct("|") => {
                let j = next_non_space(&tokens, i + 1);
                if tokens.get(j) == Some(&Token::Ident("default")) {
                    match tokens.get(j + 1) {
                        Some(Token::Punct(":")) => {
                            out.push_str("| fallback(value=");
                            if let Some(arg) = tokens.get(j + 2) {
                                out.push_str(arg.text());
                            }
                            out.push(')');
                            i = j + 3;
                            continue;
                        }
                        Some(Token::Punct("(")) => {
                            out.push_str("| fallback");
                            i = j + 1;
                            continue;
                        }
                        _ => {}
                    }
                }
                out.push('|');
            }
            Token::Ident(name) => out.push_str(loop_alias(name).unwrap_or(name)),
            ref token => out.push_str(token.text()),
        }
        i += 1;
    }
    out
}

/// Guards an output expression that starts with a variable, as in `name` or `item.title|upper`,
/// so that it renders as nothing when the variable is undefined. Anything else (literals, calls,
/// arithmetic) is left alone.
fn guard(expr: &str) -> String {
    let tokens = lex(expr);
    let significant = tokens
        .iter()
        .enumerate()
        .filter(|&(_, t)| !matches!(*t, Token::Space(_)))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    // Whitespace control dashes, as in `{{- name -}}`.
    let mut first = 0;
    if significant.first().map(|&i| tokens[i]) == Some(Token::Punct("-")) {
        first = 1;
    }
    let ident_at = match significant.get(first) {
        Some(&i) => i,
        None => return expr.to_string(),
    };
    let name = match tokens[ident_at] {
        Token::Ident(name) => name,
        _ => return expr.to_string(),
    };
    if KEYWORDS.contains(&name) || name == "loop" || name.starts_with("loop.") {
        return expr.to_string();
    }
    let followed_by_filter_or_end = match significant.get(first + 1).map(|&i| tokens[i]) {
        None => true,
        Some(Token::Punct("|")) => true,
        Some(Token::Punct("-")) => significant.len() == first + 2,
        Some(_) => false,
    };
    if !followed_by_filter_or_end {
        return expr.to_string();
    }

    let mut out = String::with_capacity(expr.len() + 24);
    for (i, token) in tokens.iter().enumerate() {
        out.push_str(token.text());
        if i == ident_at {
            out.push_str(" | default(value=\"\")");
        }
    }
    out
}

fn next_non_space(tokens: &[Token], from: usize) -> usize {
    let mut i = from;
    while let Some(Token::Space(_)) = tokens.get(i) {
        i += 1;
    }
    i
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
    Tag(&'a str),
    Comment(&'a str),
}

/// Splits template source into text and the insides of `{{ }}`, `{% %}` and `{# #}`.
fn segments(src: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = src;
    while let Some(start) = rest.find('{') {
        let close = match rest[start + 1..].chars().next() {
            Some('{') => "}}",
            Some('%') => "%}",
            Some('#') => "#}",
            _ => {
                out.push(Segment::Text(&rest[..start + 1]));
                rest = &rest[start + 1..];
                continue;
            }
        };

        let inner_start = start + 2;
        let len = if close == "#}" {
            rest[inner_start..].find(close)
        } else {
            find_close(&rest[inner_start..], close)
        };
        let len = match len {
            Some(len) => len,
            // Unterminated; Tera will report it.
            None => break,
        };

        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let inner = &rest[inner_start..inner_start + len];
        out.push(match close {
            "}}" => Segment::Expr(inner),
            "%}" => Segment::Tag(inner),
            _ => Segment::Comment(inner),
        });
        rest = &rest[inner_start + len + close.len()..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Finds `close` outside of string literals.
fn find_close(s: &str, close: &str) -> Option<usize> {
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' || c == '`' => quote = Some(c),
            None if s[i..].starts_with(close) => return Some(i),
            None => {}
        }
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token<'a> {
    Str(&'a str),
    Ident(&'a str),
    Number(&'a str),
    Space(&'a str),
    Punct(&'a str),
}

impl<'a> Token<'a> {
    fn text(&self) -> &'a str {
        match *self {
            Token::Str(s)
            | Token::Ident(s)
            | Token::Number(s)
            | Token::Space(s)
            | Token::Punct(s) => s,
        }
    }
}

fn lex(expr: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        let end_while = |chars: &mut ::std::iter::Peekable<::std::str::CharIndices>,
                         pred: fn(char) -> bool| {
            let mut end = start + c.len_utf8();
            while let Some(&(i, c)) = chars.peek() {
                if !pred(c) {
                    break;
                }
                end = i + c.len_utf8();
                chars.next();
            }
            end
        };

        let token = if c == '"' || c == '\'' || c == '`' {
            let mut end = expr.len();
            let mut escaped = false;
            for (i, d) in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if d == '\\' {
                    escaped = true;
                } else if d == c {
                    end = i + d.len_utf8();
                    break;
                }
            }
            Token::Str(&expr[start..end])
        } else if c.is_alphabetic() || c == '_' {
            let end = end_while(&mut chars, |c| c.is_alphanumeric() || c == '_' || c == '.');
            Token::Ident(&expr[start..end])
        } else if c.is_ascii_digit() {
            let end = end_while(&mut chars, |c| c.is_ascii_digit() || c == '.');
            Token::Number(&expr[start..end])
        } else if c.is_whitespace() {
            let end = end_while(&mut chars, char::is_whitespace);
            Token::Space(&expr[start..end])
        } else {
            Token::Punct(&expr[start..start + c.len_utf8()])
        };
        tokens.push(token);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_django_default() {
        assert_eq!(
            translate("Hi {{ name|default:'friend' }}!"),
            "Hi {{ name | default(value=\"\")| fallback(value='friend') }}!"
        );
        assert_eq!(
            translate("{{ company | default:\"Us\" }}"),
            "{{ company | default(value=\"\") | fallback(value=\"Us\") }}"
        );
        assert_eq!(
            translate("{{ a|default:b|upper }}"),
            "{{ a | default(value=\"\")| fallback(value=b)|upper }}"
        );
    }

    #[test]
    fn rewrites_tera_default() {
        assert_eq!(
            translate("{{ x | default(value=1) }}"),
            "{{ x | default(value=\"\") | fallback(value=1) }}"
        );
    }

    #[test]
    fn rewrites_forloop() {
        assert_eq!(
            translate("{% for x in xs %}{{ forloop.counter }}{% if forloop.last %}.{% endif %}{% endfor %}"),
            "{% for x in xs %}{{ loop.index }}{% if loop.last %}.{% endif %}{% endfor %}"
        );
    }

    #[test]
    fn guards_printed_variables() {
        assert_eq!(
            translate("{{ item.title }}"),
            "{{ item.title | default(value=\"\") }}"
        );
        assert_eq!(
            translate("{{- name|upper -}}"),
            "{{- name | default(value=\"\")|upper -}}"
        );
        // Only a leading variable can be guarded.
        assert_eq!(translate("{{ a + b }}"), "{{ a + b }}");
        assert_eq!(translate("{{ now() }}"), "{{ now() }}");
        assert_eq!(translate("{{ 'x' }}"), "{{ 'x' }}");
        assert_eq!(translate("{{ loop.index }}"), "{{ loop.index }}");
    }

    #[test]
    fn leaves_text_and_strings_alone() {
        let src = "body { color: red; } {{ \"|default:'x'\" }} {# {{ nope }} #}";
        assert_eq!(translate(src), src);
    }

    #[test]
    fn unterminated_tags_pass_through() {
        let src = "Hello {{ name";
        assert_eq!(translate(src), src);
    }

    #[test]
    fn finds_referenced_names() {
        let refs = References::scan(&translate(
            "{{ name }} {% if role and not admin %}{{ role|upper }}{% endif %}\
             {% for item in items %}{{ item.title }} {{ loop.index }}{% endfor %}\
             {{ start_url|default:fallback_url }} {% if x is defined %}{% endif %}",
        ));
        let names = refs.names().into_iter().collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["admin", "fallback_url", "items", "name", "role", "start_url", "x"]
        );
    }

    #[test]
    fn fills_missing_values() {
        let refs = References::scan(
            "{{ name }} {{ user.email }} {% for row in rows %}{{ row }}{% endfor %}",
        );
        let supplied = json!({ "name": "Ada" });
        let filled = refs.fill(supplied.as_object().expect("object"));
        assert_eq!(
            Value::Object(filled),
            json!({ "name": "Ada", "user": { "email": "" }, "rows": [], "row": "" })
        );
    }

    #[test]
    fn fill_keeps_supplied_values() {
        let refs = References::scan("{{ user.email }} {% for r in rows %}{% endfor %}");
        let supplied = json!({ "user": { "email": "a@b.c" }, "rows": [1, 2] });
        let filled = refs.fill(supplied.as_object().expect("object"));
        assert_eq!(Value::Object(filled), supplied);
    }
}
