use std::collections::HashMap;
use std::str::FromStr;

use bytes::{Buf, Bytes};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::reply::Response;

use crate::config::BuiltinTemplate;
use crate::db::{
    CampaignChanges, EmailTemplate, NewCampaign, NewRecipient, NewTemplate, TemplateBody,
    TemplateChanges, TemplateFilter, TemplateVariable,
};
use crate::dispatch::{template_context, Resolved, SendRequest};
use crate::importer;
use crate::web::{json_reply, State};
use crate::{ErrorKind, Result};

/// Query-string parameters.
pub type Params = HashMap<String, String>;

#[derive(Serialize)]
struct Message {
    message: &'static str,
}

fn ok_message(message: &'static str) -> Response {
    json_reply(StatusCode::OK, &Message { message })
}

/// Parses an optional query parameter. Blank values count as absent.
fn param<T: FromStr>(params: &Params, name: &'static str) -> Result<Option<T>> {
    match params.get(name).map(|s| s.trim()) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| ErrorKind::InvalidData(format!("Invalid {}: {:?}", name, s)).into()),
    }
}

fn required<T: FromStr>(params: &Params, name: &'static str) -> Result<T> {
    param(params, name)?.ok_or_else(|| ErrorKind::MissingParameter(name).into())
}

/// Parses a JSON request body. An empty body is treated as `{}`.
fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(serde_json::from_str("{}")?)
    } else {
        Ok(serde_json::from_slice(body)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CampaignInput {
    campaign_name: Option<String>,
    template_id: Option<i32>,
    custom_subject: Option<String>,
    custom_message: Option<String>,
    use_custom_template: Option<bool>,
}

pub async fn list_campaigns(state: State) -> Result<Response> {
    let campaigns = state.db.list_campaigns().await?;
    Ok(json_reply(StatusCode::OK, &campaigns))
}

pub async fn create_campaign(state: State, body: Bytes) -> Result<Response> {
    let input: CampaignInput = json_body(&body)?;
    let name = input
        .campaign_name
        .ok_or(ErrorKind::MissingParameter("campaign_name"))?;
    let campaign = state
        .db
        .create_campaign(NewCampaign {
            name,
            template_id: input.template_id,
            custom_subject: input.custom_subject,
            custom_message: input.custom_message,
            use_custom_template: input.use_custom_template.unwrap_or(false),
        })
        .await?;
    Ok(json_reply(StatusCode::CREATED, &campaign))
}

pub async fn rename_campaign(state: State, params: Params) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let name = required::<String>(&params, "campaign_name")?;
    let campaign = state
        .db
        .update_campaign(
            id,
            CampaignChanges {
                name: Some(name),
                ..CampaignChanges::default()
            },
        )
        .await?;
    Ok(json_reply(StatusCode::OK, &campaign))
}

pub async fn update_campaign(state: State, params: Params, body: Bytes) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let input: CampaignInput = json_body(&body)?;
    let campaign = state
        .db
        .update_campaign(
            id,
            CampaignChanges {
                name: input.campaign_name,
                template_id: input.template_id,
                custom_subject: input.custom_subject,
                custom_message: input.custom_message,
                use_custom_template: input.use_custom_template,
            },
        )
        .await?;
    Ok(json_reply(StatusCode::OK, &campaign))
}

pub async fn delete_campaign(state: State, params: Params) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    state.db.delete_campaign(id).await?;
    Ok(ok_message("Campaign deleted successfully"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageInput {
    message: Option<String>,
}

fn send_status(failed: usize) -> StatusCode {
    if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    }
}

pub async fn send_emails(state: State, params: Params, body: Bytes) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let builtin_id = param(&params, "email_template")?;
    let input: MessageInput = json_body(&body)?;
    let summary = state
        .dispatcher
        .send(
            id,
            SendRequest {
                message: input.message,
                builtin_id,
                ..SendRequest::default()
            },
        )
        .await?;
    Ok(json_reply(send_status(summary.failed), &summary))
}

pub async fn send_enhanced(state: State, params: Params, body: Bytes) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let request: SendRequest = json_body(&body)?;
    let summary = state.dispatcher.send(id, request).await?;
    Ok(json_reply(send_status(summary.failed), &summary))
}

/// Reads the `file` part of an upload.
async fn read_file(form: FormData) -> Result<Option<(String, Vec<u8>)>> {
    let mut form = Box::pin(form);
    while let Some(part) = form.try_next().await? {
        if part.name() != "file" {
            continue;
        }
        let filename = part.filename().unwrap_or("").to_string();
        let mut data = Vec::new();
        let mut stream = Box::pin(part.stream());
        while let Some(chunk) = stream.try_next().await? {
            data.extend_from_slice(chunk.chunk());
        }
        return Ok(Some((filename, data)));
    }
    Ok(None)
}

pub async fn upload(state: State, params: Params, form: FormData) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let (filename, data) = read_file(form).await?.ok_or(ErrorKind::NoFile)?;
    let rows = importer::read_rows(&filename, &data, &state.config.import)?;
    let report = importer::import(&state.db, id, rows).await?;
    Ok(json_reply(StatusCode::CREATED, &report))
}

pub async fn list_emails(state: State, params: Params) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let recipients = state.db.list_recipients(id).await?;
    Ok(json_reply(StatusCode::OK, &recipients))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecipientInput {
    email_address: Option<String>,
    name: Option<String>,
}

pub async fn add_email(state: State, params: Params, body: Bytes) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let input: RecipientInput = json_body(&body)?;
    let email_address = input
        .email_address
        .ok_or(ErrorKind::MissingParameter("email_address"))?;
    let recipient = state
        .db
        .add_recipient(
            id,
            NewRecipient {
                email_address,
                name: input.name,
            },
        )
        .await?;
    Ok(json_reply(StatusCode::CREATED, &recipient))
}

pub async fn update_email(state: State, params: Params, body: Bytes) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let address = required(&params, "email_add")?;
    let input: RecipientInput = json_body(&body)?;
    let recipient = state.db.rename_recipient(id, address, input.name).await?;
    Ok(json_reply(StatusCode::OK, &recipient))
}

pub async fn delete_email(state: State, params: Params) -> Result<Response> {
    let id = required(&params, "campaign_id")?;
    let address = required(&params, "email_add")?;
    state.db.delete_recipient(id, address).await?;
    Ok(ok_message("Email deleted successfully"))
}

/// A built-in template, as listed.
#[derive(Serialize)]
struct BuiltinListing<'a> {
    template_id: u32,
    name: &'a str,
    subject: &'a str,
    html_file: &'a str,
    is_active: bool,
}

impl<'a> From<&'a BuiltinTemplate> for BuiltinListing<'a> {
    fn from(builtin: &'a BuiltinTemplate) -> BuiltinListing<'a> {
        BuiltinListing {
            template_id: builtin.id,
            name: &builtin.name,
            subject: &builtin.subject,
            html_file: &builtin.file,
            is_active: true,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Listing<'a> {
    Builtin(BuiltinListing<'a>),
    Custom(EmailTemplate),
}

fn flag(params: &Params, name: &str) -> bool {
    params
        .get(name)
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false)
}

pub async fn list_templates(state: State, params: Params) -> Result<Response> {
    let search = params
        .get("search")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let custom = state
        .db
        .list_templates(TemplateFilter {
            active_only: flag(&params, "active_only"),
            search: search.clone(),
        })
        .await?;

    let needle = search.map(|s| s.to_lowercase());
    let listings = state
        .renderer
        .builtins()
        .iter()
        .filter(|b| {
            needle
                .as_ref()
                .map_or(true, |n| b.name.to_lowercase().contains(n.as_str()))
        })
        .map(|b| Listing::Builtin(b.into()))
        .chain(custom.into_iter().map(Listing::Custom))
        .collect::<Vec<_>>();
    Ok(json_reply(StatusCode::OK, &listings))
}

/// The fields of a template create or update request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TemplateInput {
    #[serde(alias = "template_name")]
    name: Option<String>,
    description: Option<String>,
    subject: Option<String>,
    html_content: Option<String>,
    html_file: Option<String>,
    css_styles: Option<String>,
    is_active: Option<bool>,
    is_default: Option<bool>,
    template_variables: Option<Vec<TemplateVariable>>,
}

impl TemplateInput {
    fn body(&mut self) -> Result<Option<TemplateBody>> {
        match (self.html_content.take(), self.html_file.take()) {
            (Some(_), Some(_)) => Err(ErrorKind::InvalidData(
                "Give either html_content or html_file, not both".to_string(),
            )
            .into()),
            (Some(html), None) => Ok(Some(TemplateBody::Inline(html))),
            (None, Some(file)) => Ok(Some(TemplateBody::File(file.trim().to_string()))),
            (None, None) => Ok(None),
        }
    }
}

pub async fn create_template(state: State, body: Bytes) -> Result<Response> {
    let mut input: TemplateInput = json_body(&body)?;
    let template_body = input
        .body()?
        .ok_or(ErrorKind::MissingParameter("html_content"))?;
    let name = input.name.ok_or(ErrorKind::MissingParameter("name"))?;
    let subject = input.subject.ok_or(ErrorKind::MissingParameter("subject"))?;
    state.renderer.check(&subject, &template_body)?;

    let template = state
        .db
        .create_template(NewTemplate {
            name,
            description: input.description.unwrap_or_default(),
            subject,
            body: template_body,
            css_styles: input.css_styles.unwrap_or_default(),
            is_active: input.is_active.unwrap_or(true),
            is_default: input.is_default.unwrap_or(false),
            variables: input.template_variables.unwrap_or_default(),
        })
        .await?;
    Ok(json_reply(StatusCode::CREATED, &template))
}

pub async fn get_template(id: i32, state: State) -> Result<Response> {
    let template = state.db.get_template(id).await?;
    Ok(json_reply(StatusCode::OK, &template))
}

pub async fn update_template(id: i32, state: State, body: Bytes) -> Result<Response> {
    let mut input: TemplateInput = json_body(&body)?;
    let template_body = input.body()?;
    if input.subject.is_some() || template_body.is_some() {
        let current = state.db.get_template(id).await?;
        let subject = input.subject.as_deref().unwrap_or(&current.subject);
        state
            .renderer
            .check(subject, template_body.as_ref().unwrap_or(&current.body))?;
    }

    let template = state
        .db
        .update_template(
            id,
            TemplateChanges {
                name: input.name,
                description: input.description,
                subject: input.subject,
                body: template_body,
                css_styles: input.css_styles,
                is_active: input.is_active,
                is_default: input.is_default,
                variables: input.template_variables,
            },
        )
        .await?;
    Ok(json_reply(StatusCode::OK, &template))
}

pub async fn delete_template(id: i32, state: State) -> Result<Response> {
    state.db.delete_template(id).await?;
    Ok(ok_message("Template deleted successfully"))
}

/// Finds the template a preview is for.
async fn preview_target(
    state: &State,
    template_id: Option<i32>,
    builtin_id: Option<u32>,
) -> Result<Resolved> {
    match (template_id, builtin_id) {
        (Some(id), _) => Ok(Resolved::Custom(state.db.get_template(id).await?)),
        (None, Some(id)) => state
            .renderer
            .builtin(id)
            .cloned()
            .map(Resolved::Builtin)
            .ok_or_else(|| ErrorKind::BuiltinNotFound(id).into()),
        (None, None) => Err(ErrorKind::MissingParameter("template_id").into()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PreviewInput {
    template_id: Option<i32>,
    builtin_id: Option<u32>,
    sample_data: Map<String, Value>,
}

#[derive(Serialize)]
struct Preview {
    subject: String,
    html_content: String,
    sample_data_used: Vec<String>,
}

pub async fn preview_template(state: State, body: Bytes) -> Result<Response> {
    let input: PreviewInput = json_body(&body)?;
    let target = preview_target(&state, input.template_id, input.builtin_id).await?;

    let mut context = template_context(&target);
    let sample_data_used = input.sample_data.keys().cloned().collect();
    context.extend(input.sample_data);
    let rendered = state
        .renderer
        .prepare(target.subject(), &target.body())?
        .render(&context)?;
    Ok(json_reply(
        StatusCode::OK,
        &Preview {
            subject: rendered.subject,
            html_content: rendered.html,
            sample_data_used,
        },
    ))
}

#[derive(Serialize)]
struct SamplePreview<'a> {
    template_name: &'a str,
    subject: String,
    html_content: String,
}

pub async fn sample_preview(state: State, params: Params) -> Result<Response> {
    let target = preview_target(
        &state,
        param(&params, "template_id")?,
        param(&params, "builtin_id")?,
    )
    .await?;

    let mut context = template_context(&target);
    context.extend(context! {
        name: "John Doe",
        email: "john.doe@example.com",
        message: "This is a sample message for the template preview.",
        campaign_name: "Sample Campaign",
    });
    let rendered = state
        .renderer
        .prepare(target.subject(), &target.body())?
        .render(&context)?;
    Ok(json_reply(
        StatusCode::OK,
        &SamplePreview {
            template_name: target.name(),
            subject: rendered.subject,
            html_content: rendered.html,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn params_are_parsed() {
        let p = params(&[("campaign_id", " 7 "), ("blank", ""), ("bad", "x")]);
        assert_eq!(required::<i32>(&p, "campaign_id").expect("id"), 7);
        assert_eq!(param::<i32>(&p, "blank").expect("blank"), None);
        assert_eq!(
            required::<i32>(&p, "missing").expect_err("missing").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            param::<i32>(&p, "bad").expect_err("bad").status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn empty_bodies_are_empty_objects() {
        let input: MessageInput = json_body(&Bytes::from_static(b"  ")).expect("empty");
        assert_eq!(input.message, None);
        let err = json_body::<MessageInput>(&Bytes::from_static(b"{nope")).expect_err("bad json");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn template_bodies_are_one_or_the_other() {
        let mut input: TemplateInput =
            serde_json::from_str(r#"{"html_file": " newsletter.html "}"#).expect("json");
        assert_eq!(
            input.body().expect("body"),
            Some(TemplateBody::File("newsletter.html".to_string()))
        );

        let mut input: TemplateInput =
            serde_json::from_str(r#"{"html_content": "<p/>", "html_file": "a.html"}"#)
                .expect("json");
        assert!(input.body().is_err());
    }

    #[test]
    fn flags_accept_common_spellings() {
        let p = params(&[("a", "True"), ("b", "0"), ("c", "1")]);
        assert!(flag(&p, "a"));
        assert!(!flag(&p, "b"));
        assert!(flag(&p, "c"));
        assert!(!flag(&p, "d"));
    }
}
