//! Row types, and the records the API hands out.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::schema::{campaigns, email_templates, recipients, template_variables};

/// A campaign: a named batch of recipients plus its send settings.
#[derive(Clone, Debug, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = campaigns)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Campaign {
    #[serde(rename = "campaign_id")]
    pub id: i32,
    #[serde(rename = "campaign_name")]
    pub name: String,
    #[serde(rename = "custom_template_id")]
    pub template_id: Option<i32>,
    pub custom_subject: Option<String>,
    pub custom_message: Option<String>,
    pub use_custom_template: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A campaign as listed, with its template (if any) and recipient count.
#[derive(Clone, Debug, Serialize)]
pub struct CampaignDetail {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub custom_template: Option<TemplateSummary>,
    pub email_count: i64,
}

/// The parts of a template a campaign listing shows.
#[derive(Clone, Debug, PartialEq, Eq, Queryable, Selectable, Serialize)]
#[diesel(table_name = email_templates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TemplateSummary {
    #[serde(rename = "template_id")]
    pub id: i32,
    pub name: String,
    pub subject: String,
    pub is_active: bool,
}

/// One recipient of one campaign.
#[derive(Clone, Debug, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = recipients)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Recipient {
    #[serde(rename = "email_id")]
    pub id: i32,
    pub campaign_id: i32,
    pub email_address: String,
    pub name: Option<String>,
    pub added_at: NaiveDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRecipient {
    pub email_address: String,
    pub name: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = recipients)]
pub(crate) struct NewRecipientRow<'a> {
    pub campaign_id: i32,
    pub email_address: &'a str,
    pub name: Option<&'a str>,
    pub added_at: NaiveDateTime,
}

/// A template body: either markup stored with the template, or the name of a template file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateBody {
    #[serde(rename = "html_content")]
    Inline(String),
    #[serde(rename = "html_file")]
    File(String),
}

impl TemplateBody {
    fn from_row(kind: &str, body: String) -> TemplateBody {
        match kind {
            "file" => TemplateBody::File(body),
            _ => TemplateBody::Inline(body),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match *self {
            TemplateBody::Inline(_) => "inline",
            TemplateBody::File(_) => "file",
        }
    }

    pub(crate) fn text(&self) -> &str {
        match *self {
            TemplateBody::Inline(ref s) | TemplateBody::File(ref s) => s,
        }
    }
}

/// The declared type of a template variable. Informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Text,
    Email,
    Url,
    Date,
    Number,
}

impl Default for VariableType {
    fn default() -> VariableType {
        VariableType::Text
    }
}

impl VariableType {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableType::Text => "text",
            VariableType::Email => "email",
            VariableType::Url => "url",
            VariableType::Date => "date",
            VariableType::Number => "number",
        }
    }
}

impl Display for VariableType {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariableType {
    type Err = String;

    fn from_str(s: &str) -> Result<VariableType, String> {
        match s {
            "text" => Ok(VariableType::Text),
            "email" => Ok(VariableType::Email),
            "url" => Ok(VariableType::Url),
            "date" => Ok(VariableType::Date),
            "number" => Ok(VariableType::Number),
            _ => Err(format!("unknown variable type {:?}", s)),
        }
    }
}

/// A variable a template documents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub variable_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub variable_type: VariableType,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub description: String,
}

/// A custom template, with its variables.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmailTemplate {
    #[serde(rename = "template_id")]
    pub id: i32,
    pub name: String,
    pub description: String,
    pub subject: String,
    #[serde(flatten)]
    pub body: TemplateBody,
    pub css_styles: String,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    #[serde(rename = "template_variables")]
    pub variables: Vec<TemplateVariable>,
    pub variables_count: usize,
}

impl EmailTemplate {
    pub(crate) fn from_rows(row: TemplateRow, variables: Vec<VariableRow>) -> EmailTemplate {
        let variables = variables
            .into_iter()
            .map(TemplateVariable::from)
            .collect::<Vec<_>>();
        EmailTemplate {
            id: row.id,
            name: row.name,
            description: row.description,
            subject: row.subject,
            body: TemplateBody::from_row(&row.body_kind, row.body),
            css_styles: row.css_styles,
            is_active: row.is_active,
            is_default: row.is_default,
            created_at: row.created_at,
            updated_at: row.updated_at,
            variables_count: variables.len(),
            variables,
        }
    }
}

#[derive(Clone, Debug, Queryable, Selectable, Identifiable)]
#[diesel(table_name = email_templates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct TemplateRow {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub subject: String,
    pub body_kind: String,
    pub body: String,
    pub css_styles: String,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Clone, Debug, Queryable, Selectable, Identifiable, Associations)]
#[diesel(table_name = template_variables)]
#[diesel(belongs_to(TemplateRow, foreign_key = template_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct VariableRow {
    pub id: i32,
    pub template_id: i32,
    pub variable_name: String,
    pub display_name: String,
    pub variable_type: String,
    pub default_value: Option<String>,
    pub is_required: bool,
    pub description: String,
}

impl From<VariableRow> for TemplateVariable {
    fn from(row: VariableRow) -> TemplateVariable {
        TemplateVariable {
            variable_name: row.variable_name,
            display_name: row.display_name,
            variable_type: row.variable_type.parse().unwrap_or_default(),
            default_value: row.default_value,
            is_required: row.is_required,
            description: row.description,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = template_variables)]
pub(crate) struct NewVariableRow<'a> {
    pub template_id: i32,
    pub variable_name: &'a str,
    pub display_name: &'a str,
    pub variable_type: &'static str,
    pub default_value: Option<&'a str>,
    pub is_required: bool,
    pub description: &'a str,
}

/// A template to be created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTemplate {
    pub name: String,
    pub description: String,
    pub subject: String,
    pub body: TemplateBody,
    pub css_styles: String,
    pub is_active: bool,
    pub is_default: bool,
    pub variables: Vec<TemplateVariable>,
}

/// Changes to a template. `None` leaves a field as it is; `Some` variables replace all of the
/// template's variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub subject: Option<String>,
    pub body: Option<TemplateBody>,
    pub css_styles: Option<String>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    pub variables: Option<Vec<TemplateVariable>>,
}

/// Filters for listing templates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateFilter {
    pub active_only: bool,
    pub search: Option<String>,
}

/// A campaign to be created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewCampaign {
    pub name: String,
    pub template_id: Option<i32>,
    pub custom_subject: Option<String>,
    pub custom_message: Option<String>,
    pub use_custom_template: bool,
}

/// Changes to a campaign; `None` leaves a field as it is.
///
/// A `template_id` naming a template that doesn't exist, or isn't active, clears the campaign's
/// template instead of failing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CampaignChanges {
    pub name: Option<String>,
    pub template_id: Option<i32>,
    pub custom_subject: Option<String>,
    pub custom_message: Option<String>,
    pub use_custom_template: Option<bool>,
}
