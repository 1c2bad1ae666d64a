//! Runtime settings shared by the importer, the renderer, and the dispatcher.

use std::path::PathBuf;

/// All of the application's settings. Built once in `main` and passed to whatever needs it.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub dispatch: DispatchSettings,
    pub import: ImportSettings,
    pub templates: TemplateSettings,
}

/// Settings for the bulk dispatcher.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// The built-in template used when neither the request nor the campaign picks one.
    pub default_builtin: u32,

    /// The message used when neither the request nor the campaign supplies one.
    pub default_message: String,

    /// The `name` given to recipients imported without one.
    pub fallback_name: String,
}

impl Default for DispatchSettings {
    fn default() -> DispatchSettings {
        DispatchSettings {
            default_builtin: 1,
            default_message: "Thank you for signing up. We're excited to have you on board, and \
                              we'll be in touch soon with everything you need to get started."
                .to_string(),
            fallback_name: "Valued Customer".to_string(),
        }
    }
}

/// Settings for spreadsheet uploads.
#[derive(Clone, Debug)]
pub struct ImportSettings {
    /// Accepted file extensions, lowercase and without the dot.
    pub extensions: Vec<String>,

    /// The largest accepted upload, in bytes.
    pub max_upload_bytes: u64,
}

impl Default for ImportSettings {
    fn default() -> ImportSettings {
        ImportSettings {
            extensions: ["xlsx", "xlsm", "xls", "ods", "csv"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A template shipped as a file and addressed by a small integer rather than a database row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltinTemplate {
    pub id: u32,
    pub name: String,
    pub file: String,
    pub subject: String,
}

impl BuiltinTemplate {
    fn new(id: u32, name: &str, file: &str, subject: &str) -> BuiltinTemplate {
        BuiltinTemplate {
            id,
            name: name.to_string(),
            file: file.to_string(),
            subject: subject.to_string(),
        }
    }
}

/// Settings for the template loader.
#[derive(Clone, Debug)]
pub struct TemplateSettings {
    /// The id → file mapping for built-in templates.
    pub builtins: Vec<BuiltinTemplate>,

    /// A directory whose `*.html` files are loaded on top of the embedded ones.
    pub dir: Option<PathBuf>,
}

impl Default for TemplateSettings {
    fn default() -> TemplateSettings {
        TemplateSettings {
            builtins: vec![
                BuiltinTemplate::new(1, "Classic", "classic.html", "A message for {{ name }}"),
                BuiltinTemplate::new(2, "Spotlight", "spotlight.html", "Something new for you"),
                BuiltinTemplate::new(3, "Newsletter", "newsletter.html", "Our latest news"),
                BuiltinTemplate::new(4, "Minimal", "minimal.html", "Hello {{ name }}"),
            ],
            dir: None,
        }
    }
}

impl TemplateSettings {
    /// Looks up a built-in template by id.
    pub fn builtin(&self, id: u32) -> Option<&BuiltinTemplate> {
        self.builtins.iter().find(|b| b.id == id)
    }
}
