//! The bulk dispatcher: sends a campaign's email to each of its recipients.

use std::sync::Arc;

use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{BuiltinTemplate, DispatchSettings};
use crate::db::{Campaign, EmailTemplate, Recipient, TemplateBody, DB};
use crate::mailer::Transport;
use crate::render::Renderer;
use crate::util::log_err;
use crate::{ErrorKind, Result};

/// What a send request asks for. Empty strings count as absent.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SendRequest {
    pub message: Option<String>,
    pub subject: Option<String>,
    /// A built-in template to use.
    #[serde(skip)]
    pub builtin_id: Option<u32>,
    /// A custom template to use.
    pub template_id: Option<i32>,
    /// Overrides the campaign's own "use custom template" flag.
    pub use_custom_template: Option<bool>,
}

/// The template a send uses.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolved {
    Builtin(BuiltinTemplate),
    Custom(EmailTemplate),
}

/// Identifies the template a send used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TemplateRef {
    Builtin { id: u32, name: String },
    Custom { id: i32, name: String },
}

impl Resolved {
    pub(crate) fn name(&self) -> &str {
        match *self {
            Resolved::Builtin(ref b) => &b.name,
            Resolved::Custom(ref t) => &t.name,
        }
    }

    pub(crate) fn subject(&self) -> &str {
        match *self {
            Resolved::Builtin(ref b) => &b.subject,
            Resolved::Custom(ref t) => &t.subject,
        }
    }

    pub(crate) fn body(&self) -> TemplateBody {
        match *self {
            Resolved::Builtin(ref b) => TemplateBody::File(b.file.clone()),
            Resolved::Custom(ref t) => t.body.clone(),
        }
    }

    fn reference(&self) -> TemplateRef {
        match *self {
            Resolved::Builtin(ref b) => TemplateRef::Builtin {
                id: b.id,
                name: b.name.clone(),
            },
            Resolved::Custom(ref t) => TemplateRef::Custom {
                id: t.id,
                name: t.name.clone(),
            },
        }
    }
}

/// The counts reported for a send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SendSummary {
    pub sent: usize,
    pub failed: usize,
    pub custom_message_used: bool,
    pub template: TemplateRef,
}

/// Which template a request selects, before anything is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Choice {
    /// A custom template named by the request. Must exist and be active.
    Custom(i32),
    /// A built-in template named by the request. Must exist.
    Builtin(u32),
    /// The campaign's own template. Falls back to the default if it's gone or inactive.
    Association(i32),
    Default,
}

fn choose(request: &SendRequest, campaign: &Campaign) -> Choice {
    if let Some(id) = request.template_id {
        return Choice::Custom(id);
    }
    if let Some(id) = request.builtin_id {
        return Choice::Builtin(id);
    }
    let use_custom = request
        .use_custom_template
        .unwrap_or(campaign.use_custom_template);
    match campaign.template_id {
        Some(id) if use_custom => Choice::Association(id),
        _ => Choice::Default,
    }
}

/// The first of `options` that isn't blank.
fn first_given<'a>(options: &[Option<&'a str>]) -> Option<&'a str> {
    options
        .iter()
        .filter_map(|o| *o)
        .find(|s| !s.trim().is_empty())
}

/// Sends campaigns through a transport.
#[derive(Clone)]
pub struct Dispatcher {
    db: DB,
    renderer: Arc<Renderer>,
    transport: Arc<dyn Transport>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        db: DB,
        renderer: Arc<Renderer>,
        transport: Arc<dyn Transport>,
        settings: DispatchSettings,
    ) -> Dispatcher {
        Dispatcher {
            db,
            renderer,
            transport,
            settings,
        }
    }

    /// Sends a campaign to each of its recipients.
    ///
    /// Fails without sending anything if the campaign doesn't exist, has no recipients, or the
    /// request names a template that can't be used. Failures for single recipients are logged
    /// and counted, and never stop the rest of the batch.
    pub async fn send(&self, campaign_id: i32, request: SendRequest) -> Result<SendSummary> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        let recipients = self.db.list_recipients(campaign_id).await?;
        if recipients.is_empty() {
            return Err(ErrorKind::NoRecipients(campaign_id).into());
        }
        let resolved = self.resolve(&request, &campaign).await?;

        let custom_message = first_given(&[
            request.message.as_deref(),
            campaign.custom_message.as_deref(),
        ]);
        let message = custom_message.unwrap_or(&self.settings.default_message);
        let subject = first_given(&[
            request.subject.as_deref(),
            campaign.custom_subject.as_deref(),
        ])
        .unwrap_or_else(|| resolved.subject());

        let prepared = self.renderer.prepare(subject, &resolved.body())?;
        let base = base_context(&resolved, &campaign, message);
        let fallback_name = self.settings.fallback_name.clone();
        let transport = self.transport.clone();

        info!(
            "Sending campaign {} to {} recipients with {:?}",
            campaign_id,
            recipients.len(),
            resolved.reference()
        );
        let (sent, failed) = tokio::task::spawn_blocking(move || {
            recipients.iter().fold((0, 0), |(sent, failed), recipient| {
                let context = recipient_context(&base, recipient, &fallback_name);
                let result = prepared.render(&context).and_then(|email| {
                    transport.send(&recipient.email_address, &email.subject, email.html)
                });
                match result {
                    Ok(()) => (sent + 1, failed),
                    Err(e) => {
                        error!("Couldn't send to {}", recipient.email_address);
                        log_err(e.into());
                        (sent, failed + 1)
                    }
                }
            })
        })
        .await?;

        let level = if failed == 0 { Level::Info } else { Level::Error };
        log!(
            level,
            "Sending campaign {} finished ({} sent, {} failed).",
            campaign_id,
            sent,
            failed
        );
        Ok(SendSummary {
            sent,
            failed,
            custom_message_used: custom_message.is_some(),
            template: resolved.reference(),
        })
    }

    async fn resolve(&self, request: &SendRequest, campaign: &Campaign) -> Result<Resolved> {
        match choose(request, campaign) {
            Choice::Custom(id) => {
                let template = self.db.get_template(id).await?;
                if !template.is_active {
                    return Err(ErrorKind::TemplateNotFound(id).into());
                }
                Ok(Resolved::Custom(template))
            }
            Choice::Builtin(id) => self.builtin(id),
            Choice::Association(id) => match self.db.get_template(id).await {
                Ok(template) if template.is_active => Ok(Resolved::Custom(template)),
                Ok(_) => {
                    warn!(
                        "Template {} of campaign {} is inactive; using the default",
                        id, campaign.id
                    );
                    self.builtin(self.settings.default_builtin)
                }
                Err(ref e) if matches!(*e.kind(), ErrorKind::TemplateNotFound(_)) => {
                    warn!(
                        "Template {} of campaign {} is gone; using the default",
                        id, campaign.id
                    );
                    self.builtin(self.settings.default_builtin)
                }
                Err(e) => Err(e),
            },
            Choice::Default => self.builtin(self.settings.default_builtin),
        }
    }

    fn builtin(&self, id: u32) -> Result<Resolved> {
        self.renderer
            .builtin(id)
            .cloned()
            .map(Resolved::Builtin)
            .ok_or_else(|| ErrorKind::BuiltinNotFound(id).into())
    }
}

/// The context a template itself contributes: its variables' defaults and its styles.
pub(crate) fn template_context(resolved: &Resolved) -> Map<String, Value> {
    match *resolved {
        Resolved::Custom(ref template) => {
            let mut context = template
                .variables
                .iter()
                .filter_map(|v| {
                    v.default_value
                        .as_ref()
                        .map(|d| (v.variable_name.clone(), Value::String(d.clone())))
                })
                .collect::<Map<_, _>>();
            context.extend(context! { css_styles: template.css_styles.clone() });
            context
        }
        Resolved::Builtin(_) => context! { css_styles: "" },
    }
}

/// The context shared by every recipient of a send.
fn base_context(resolved: &Resolved, campaign: &Campaign, message: &str) -> Map<String, Value> {
    let mut context = template_context(resolved);
    context.extend(context! {
        message: message,
        campaign_name: campaign.name.clone(),
    });
    context
}

fn recipient_context(
    base: &Map<String, Value>,
    recipient: &Recipient,
    fallback_name: &str,
) -> Map<String, Value> {
    let mut context = base.clone();
    let name = first_given(&[recipient.name.as_deref()]).unwrap_or(fallback_name);
    context.extend(context! {
        name: name,
        email: recipient.email_address.clone(),
    });
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use crate::config::TemplateSettings;
    use crate::db::{CampaignChanges, NewCampaign, NewRecipient, NewTemplate, TemplateVariable};

    /// Records what would have been sent, failing for some addresses.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String, String)>>,
        fail_for: HashSet<String>,
    }

    impl Transport for Recorder {
        fn send(&self, to: &str, subject: &str, html: String) -> Result<()> {
            if self.fail_for.contains(to) {
                return Err(ErrorKind::InvalidData(format!("refused {}", to)).into());
            }
            self.sent
                .lock()
                .expect("lock")
                .push((to.to_string(), subject.to_string(), html));
            Ok(())
        }
    }

    struct Fixture {
        db: DB,
        recorder: Arc<Recorder>,
        dispatcher: Dispatcher,
        campaign_id: i32,
    }

    async fn fixture(addresses: &[(&str, Option<&str>)], fail_for: &[&str]) -> Fixture {
        let db = DB::connect(":memory:").expect("db");
        let campaign_id = db
            .create_campaign(NewCampaign {
                name: "Launch".to_string(),
                ..NewCampaign::default()
            })
            .await
            .expect("campaign")
            .campaign
            .id;
        for &(address, name) in addresses {
            db.add_recipient(
                campaign_id,
                NewRecipient {
                    email_address: address.to_string(),
                    name: name.map(str::to_string),
                },
            )
            .await
            .expect("recipient");
        }
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
            fail_for: fail_for.iter().map(|s| s.to_string()).collect(),
        });
        let renderer = Arc::new(Renderer::new(TemplateSettings::default()).expect("renderer"));
        let dispatcher = Dispatcher::new(
            db.clone(),
            renderer,
            recorder.clone(),
            DispatchSettings::default(),
        );
        Fixture {
            db,
            recorder,
            dispatcher,
            campaign_id,
        }
    }

    fn campaign(use_custom_template: bool, template_id: Option<i32>) -> Campaign {
        let now = chrono::Utc::now().naive_utc();
        Campaign {
            id: 1,
            name: "C".to_string(),
            template_id,
            custom_subject: None,
            custom_message: None,
            use_custom_template,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn requests_take_precedence_over_campaigns() {
        let c = campaign(true, Some(7));
        assert_eq!(choose(&SendRequest::default(), &c), Choice::Association(7));

        let request = SendRequest {
            builtin_id: Some(3),
            ..SendRequest::default()
        };
        assert_eq!(choose(&request, &c), Choice::Builtin(3));

        let request = SendRequest {
            template_id: Some(9),
            ..SendRequest::default()
        };
        assert_eq!(choose(&request, &c), Choice::Custom(9));

        let request = SendRequest {
            use_custom_template: Some(false),
            ..SendRequest::default()
        };
        assert_eq!(choose(&request, &c), Choice::Default);
    }

    #[test]
    fn campaigns_only_use_their_template_when_flagged() {
        assert_eq!(
            choose(&SendRequest::default(), &campaign(false, Some(7))),
            Choice::Default
        );
        assert_eq!(
            choose(&SendRequest::default(), &campaign(true, None)),
            Choice::Default
        );
        let request = SendRequest {
            use_custom_template: Some(true),
            ..SendRequest::default()
        };
        assert_eq!(
            choose(&request, &campaign(false, Some(7))),
            Choice::Association(7)
        );
    }

    #[test]
    fn blank_values_are_skipped() {
        assert_eq!(first_given(&[Some("  "), None, Some("b")]), Some("b"));
        assert_eq!(first_given(&[Some(""), None]), None);
    }

    #[tokio::test]
    async fn empty_campaigns_send_nothing() {
        let f = fixture(&[], &[]).await;
        let err = f
            .dispatcher
            .send(f.campaign_id, SendRequest::default())
            .await
            .expect_err("no recipients");
        assert_eq!(err.to_string(), "No emails found for the given campaign.");
        assert_eq!(err.status(), warp::http::StatusCode::NOT_FOUND);
        assert!(f.recorder.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let f = fixture(
            &[
                ("ada@example.com", Some("Ada")),
                ("bad@example.com", None),
                ("bob@example.com", None),
            ],
            &["bad@example.com"],
        )
        .await;
        let summary = f
            .dispatcher
            .send(
                f.campaign_id,
                SendRequest {
                    message: Some("Doors open at nine".to_string()),
                    builtin_id: Some(4),
                    ..SendRequest::default()
                },
            )
            .await
            .expect("send");
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.custom_message_used);
        assert_eq!(
            summary.template,
            TemplateRef::Builtin {
                id: 4,
                name: "Minimal".to_string()
            }
        );

        let sent = f.recorder.sent.lock().expect("lock");
        assert_eq!(sent[0].0, "ada@example.com");
        assert_eq!(sent[0].1, "Hello Ada");
        assert!(sent[0].2.contains("Doors open at nine"));
        assert_eq!(sent[1].1, "Hello Valued Customer");
    }

    #[tokio::test]
    async fn campaign_templates_and_overrides_apply() {
        let f = fixture(&[("ada@example.com", Some("Ada"))], &[]).await;
        let template = f
            .db
            .create_template(NewTemplate {
                name: "Promo".to_string(),
                description: String::new(),
                subject: "Promo for {{ name }}".to_string(),
                body: TemplateBody::Inline(
                    "<p>{{ message }} from {{ company }} ({{ campaign_name }})</p>".to_string(),
                ),
                css_styles: String::new(),
                is_active: true,
                is_default: false,
                variables: vec![TemplateVariable {
                    variable_name: "company".to_string(),
                    display_name: "Company".to_string(),
                    variable_type: Default::default(),
                    default_value: Some("TechCorp".to_string()),
                    is_required: false,
                    description: String::new(),
                }],
            })
            .await
            .expect("template");
        f.db.update_campaign(
            f.campaign_id,
            CampaignChanges {
                template_id: Some(template.id),
                use_custom_template: Some(true),
                custom_subject: Some("{{ campaign_name }}: for {{ name }}".to_string()),
                custom_message: Some("Stored message".to_string()),
                ..CampaignChanges::default()
            },
        )
        .await
        .expect("update");

        let summary = f
            .dispatcher
            .send(f.campaign_id, SendRequest::default())
            .await
            .expect("send");
        assert_eq!(summary.sent, 1);
        assert!(summary.custom_message_used);
        assert_eq!(
            summary.template,
            TemplateRef::Custom {
                id: template.id,
                name: "Promo".to_string()
            }
        );

        let sent = f.recorder.sent.lock().expect("lock");
        assert_eq!(sent[0].1, "Launch: for Ada");
        assert_eq!(sent[0].2, "<p>Stored message from TechCorp (Launch)</p>");
    }

    #[tokio::test]
    async fn unusable_explicit_templates_fail_before_sending() {
        let f = fixture(&[("ada@example.com", None)], &[]).await;
        let err = f
            .dispatcher
            .send(
                f.campaign_id,
                SendRequest {
                    builtin_id: Some(99),
                    ..SendRequest::default()
                },
            )
            .await
            .expect_err("unknown builtin");
        assert_eq!(err.status(), warp::http::StatusCode::NOT_FOUND);

        let err = f
            .dispatcher
            .send(
                f.campaign_id,
                SendRequest {
                    template_id: Some(99),
                    ..SendRequest::default()
                },
            )
            .await
            .expect_err("unknown template");
        assert_eq!(err.status(), warp::http::StatusCode::NOT_FOUND);
        assert!(f.recorder.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn defaults_apply_without_overrides() {
        let f = fixture(&[("ada@example.com", None)], &[]).await;
        let summary = f
            .dispatcher
            .send(f.campaign_id, SendRequest::default())
            .await
            .expect("send");
        assert!(!summary.custom_message_used);
        assert_eq!(
            summary.template,
            TemplateRef::Builtin {
                id: 1,
                name: "Classic".to_string()
            }
        );
        let sent = f.recorder.sent.lock().expect("lock");
        assert_eq!(sent[0].1, "A message for Valued Customer");
    }
}
