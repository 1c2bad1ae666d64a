//! The template renderer.
//!
//! Templates come in two flavours: inline markup stored with a custom template, and named files
//! (the built-in templates, plus whatever the configured template directory holds). Both are
//! Tera templates written in Django syntax; see [`compat`] for the translation.

mod compat;

use std::collections::{BTreeMap, HashMap};
use std::fs;

use serde_json::{Map, Value};
use tera::{Context, Tera};

use crate::config::{BuiltinTemplate, TemplateSettings};
use crate::db::TemplateBody;
use crate::errors::tera_message;
use crate::{ErrorKind, Result};

use self::compat::References;

pub use self::compat::translate;

/// Template files compiled into the binary.
const EMBEDDED: &[(&str, &str)] = &[
    ("classic.html", include_str!("../../templates/classic.html")),
    ("spotlight.html", include_str!("../../templates/spotlight.html")),
    ("newsletter.html", include_str!("../../templates/newsletter.html")),
    ("minimal.html", include_str!("../../templates/minimal.html")),
];

// Inline bodies get an `.html` name so Tera autoescapes them; subjects don't.
const SUBJECT: &str = "__subject";
const INLINE_BODY: &str = "__body.html";

/// A rendered email.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub html: String,
}

/// Loads template files and compiles templates against them.
#[derive(Debug)]
pub struct Renderer {
    settings: TemplateSettings,

    /// Translated sources of every template file, by name.
    files: BTreeMap<String, String>,
}

impl Renderer {
    /// Loads the embedded templates and the configured template directory, if any. Files in the
    /// directory replace embedded ones of the same name.
    pub fn new(settings: TemplateSettings) -> Result<Renderer> {
        let mut files = EMBEDDED
            .iter()
            .map(|&(name, src)| (name.to_string(), translate(src)))
            .collect::<BTreeMap<_, _>>();

        if let Some(ref dir) = settings.dir {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map_or(true, |ext| ext != "html") {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    debug!("Loading template file {}", path.display());
                    files.insert(name.to_string(), translate(&fs::read_to_string(&path)?));
                }
            }
        }

        for builtin in &settings.builtins {
            if !files.contains_key(&builtin.file) {
                return Err(ErrorKind::InvalidTemplate(format!(
                    "built-in template {} uses unknown file {:?}",
                    builtin.id, builtin.file
                ))
                .into());
            }
        }

        let renderer = Renderer { settings, files };
        // Compile everything once, so broken files are reported at start-up.
        renderer.engine()?;
        Ok(renderer)
    }

    /// The built-in templates.
    pub fn builtins(&self) -> &[BuiltinTemplate] {
        &self.settings.builtins
    }

    pub fn builtin(&self, id: u32) -> Option<&BuiltinTemplate> {
        self.settings.builtin(id)
    }

    /// Returns whether a template file with the given name is loaded.
    pub fn has_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Checks that a subject and body compile, reporting failures as invalid templates.
    pub fn check(&self, subject: &str, body: &TemplateBody) -> Result<()> {
        self.prepare(subject, body).map(|_| ())
    }

    /// Compiles a subject and body, ready to be rendered any number of times.
    pub fn prepare(&self, subject: &str, body: &TemplateBody) -> Result<Prepared> {
        let mut tera = self.engine()?;

        let subject = translate(subject);
        tera.add_raw_template(SUBJECT, &subject)
            .map_err(|e| ErrorKind::InvalidTemplate(tera_message(&e)))?;
        let mut refs = References::scan(&subject);

        let body = match *body {
            TemplateBody::Inline(ref src) => {
                let src = translate(src);
                tera.add_raw_template(INLINE_BODY, &src)
                    .map_err(|e| ErrorKind::InvalidTemplate(tera_message(&e)))?;
                refs.extend(References::scan(&src));
                INLINE_BODY.to_string()
            }
            TemplateBody::File(ref name) => {
                let src = self.files.get(name).ok_or_else(|| {
                    ErrorKind::InvalidTemplate(format!("unknown template file {:?}", name))
                })?;
                refs.extend(References::scan(src));
                name.clone()
            }
        };

        Ok(Prepared { tera, body, refs })
    }

    fn engine(&self) -> Result<Tera> {
        let mut tera = Tera::default();
        tera.register_filter("fallback", fallback);
        tera.add_raw_templates(self.files.iter())?;
        Ok(tera)
    }
}

/// A compiled subject and body.
pub struct Prepared {
    tera: Tera,
    body: String,
    refs: References,
}

impl Prepared {
    /// Renders the subject and body. Variables the context lacks render as empty.
    pub fn render(&self, context: &Map<String, Value>) -> Result<Rendered> {
        let context = Context::from_value(Value::Object(self.refs.fill(context)))?;
        let subject = self.tera.render(SUBJECT, &context)?;
        let html = self.tera.render(&self.body, &context)?;
        Ok(Rendered {
            // Headers can't span lines.
            subject: subject.split_whitespace().collect::<Vec<_>>().join(" "),
            html,
        })
    }
}

/// Django's `default` filter: replaces any falsy value, not just undefined ones.
fn fallback(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let default = args
        .get("value")
        .ok_or_else(|| tera::Error::msg("The `default` filter needs a value"))?;
    let falsy = match *value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(ref n) => n.as_f64() == Some(0.0),
        Value::String(ref s) => s.is_empty(),
        Value::Array(ref a) => a.is_empty(),
        Value::Object(ref o) => o.is_empty(),
    };
    Ok(if falsy { default.clone() } else { value.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer() -> Renderer {
        Renderer::new(TemplateSettings::default()).expect("renderer")
    }

    fn render(subject: &str, body: &str, context: Value) -> Result<Rendered> {
        let context = context.as_object().cloned().unwrap_or_default();
        renderer()
            .prepare(subject, &TemplateBody::Inline(body.to_string()))?
            .render(&context)
    }

    #[test]
    fn missing_variables_render_empty() {
        let out = render("Hi {{ name }}", "<p>{{ name }}|{{ missing }}|</p>", json!({}))
            .expect("render");
        assert_eq!(out.subject, "Hi");
        assert_eq!(out.html, "<p>||</p>");
    }

    #[test]
    fn default_filter_covers_missing_and_empty() {
        let body = "{{ company|default:'Our Company' }}";
        let out = render("s", body, json!({})).expect("render");
        assert_eq!(out.html, "Our Company");
        let out = render("s", body, json!({ "company": "" })).expect("render");
        assert_eq!(out.html, "Our Company");
        let out = render("s", body, json!({ "company": "TechCorp" })).expect("render");
        assert_eq!(out.html, "TechCorp");
    }

    #[test]
    fn conditionals_and_loops() {
        let body = "{% if role %}[{{ role }}]{% endif %}\
                    {% for t in tags %}{{ forloop.counter }}:{{ t }};{% endfor %}";
        let out = render("s", body, json!({ "tags": ["a", "b"] })).expect("render");
        assert_eq!(out.html, "1:a;2:b;");
        let out = render("s", body, json!({ "role": "dev" })).expect("render");
        assert_eq!(out.html, "[dev]");
    }

    #[test]
    fn body_is_escaped_but_subject_is_not() {
        let out = render("{{ name }}", "{{ name }}", json!({ "name": "Tom & Jerry" }))
            .expect("render");
        assert_eq!(out.subject, "Tom & Jerry");
        assert_eq!(out.html, "Tom &amp; Jerry");
    }

    #[test]
    fn subject_is_a_single_line() {
        let out = render("  Hello\n  {{ name }} ", "", json!({ "name": "Ada" })).expect("render");
        assert_eq!(out.subject, "Hello Ada");
    }

    #[test]
    fn builtin_files_render() {
        let renderer = renderer();
        for builtin in renderer.builtins() {
            let prepared = renderer
                .prepare(&builtin.subject, &TemplateBody::File(builtin.file.clone()))
                .expect("prepare");
            let context = json!({ "name": "Ada", "message": "Welcome aboard" });
            let out = prepared
                .render(context.as_object().expect("object"))
                .expect("render");
            assert!(out.html.contains("Welcome aboard"), "{}", builtin.file);
        }
    }

    #[test]
    fn newsletter_loops_over_items() {
        let renderer = renderer();
        let prepared = renderer
            .prepare("s", &TemplateBody::File("newsletter.html".to_string()))
            .expect("prepare");
        let context = json!({ "items": [{ "title": "Launch", "summary": "We shipped." }] });
        let out = prepared
            .render(context.as_object().expect("object"))
            .expect("render");
        assert!(out.html.contains("1. Launch"));
        assert!(out.html.contains("We shipped."));
    }

    #[test]
    fn missing_fields_of_loop_items_render_empty() {
        let prepared = renderer()
            .prepare("s", &TemplateBody::File("newsletter.html".to_string()))
            .expect("prepare");
        let context = json!({ "name": "Ada", "items": [{ "title": "Launch" }] });
        let out = prepared
            .render(context.as_object().expect("object"))
            .expect("render");
        assert!(out.html.contains("1. Launch"));
        assert!(out.html.contains("<p></p>"));
    }

    #[test]
    fn loop_variables_can_be_reused_outside_their_loop() {
        let body = "{% for name in xs %}[{{ name }}]{% endfor %}Hi {{ name }}{% if name %}!{% endif %}";
        let out = render("s", body, json!({})).expect("render");
        assert_eq!(out.html, "Hi ");
        let out = render("s", body, json!({ "xs": ["a"], "name": "Ada" })).expect("render");
        assert_eq!(out.html, "[a]Hi Ada!");
    }

    #[test]
    fn unknown_files_are_invalid() {
        let err = renderer()
            .check("s", &TemplateBody::File("nope.html".to_string()))
            .expect_err("unknown file");
        match *err.kind() {
            ErrorKind::InvalidTemplate(_) => {}
            ref other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn syntax_errors_are_invalid() {
        let err = renderer()
            .check("s", &TemplateBody::Inline("{% if x %}never closed".to_string()))
            .expect_err("syntax error");
        match *err.kind() {
            ErrorKind::InvalidTemplate(_) => {}
            ref other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn template_dir_overrides_embedded_files() {
        let dir = std::env::temp_dir().join(format!("campaign-mailer-render-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("minimal.html"), "Overridden for {{ name }}").expect("write");
        fs::write(dir.join("extra.html"), "Extra {{ name|default:'x' }}").expect("write");
        fs::write(dir.join("notes.txt"), "{{ ignored").expect("write");

        let renderer = Renderer::new(TemplateSettings {
            dir: Some(dir.clone()),
            ..TemplateSettings::default()
        })
        .expect("renderer");
        assert!(renderer.has_file("extra.html"));
        assert!(!renderer.has_file("notes.txt"));

        let out = renderer
            .prepare("s", &TemplateBody::File("minimal.html".to_string()))
            .expect("prepare")
            .render(json!({ "name": "Ada" }).as_object().expect("object"))
            .expect("render");
        assert_eq!(out.html, "Overridden for Ada");

        fs::remove_dir_all(&dir).ok();
    }
}
