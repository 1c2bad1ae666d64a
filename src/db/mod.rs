//! The database and related types.

mod models;
mod schema;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, Pool};
use diesel::sqlite::{Sqlite, SqliteConnection};

use crate::db::models::{NewRecipientRow, NewVariableRow, TemplateRow, VariableRow};
use crate::db::schema::{campaigns, email_templates, recipients, template_variables};
use crate::{ErrorKind, Result};

pub use crate::db::models::{
    Campaign, CampaignChanges, CampaignDetail, EmailTemplate, NewCampaign, NewRecipient,
    NewTemplate, Recipient, TemplateBody, TemplateChanges, TemplateFilter, TemplateSummary,
    TemplateVariable, VariableType,
};

const SCHEMA: &str = include_str!("schema.sql");

/// A pool of connections to the database.
#[derive(Clone)]
pub struct DB {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

/// Settings applied to every connection as the pool opens it.
#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> ::std::result::Result<(), r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(r2d2::Error::QueryError)
    }
}

impl DB {
    /// Connects to the database, creating the tables if they don't exist yet.
    ///
    /// `:memory:` gets a pool of a single connection, since every connection to it would
    /// otherwise see its own empty database.
    pub fn connect(database_url: &str) -> Result<DB> {
        let mut builder = Pool::builder().connection_customizer(Box::new(ConnectionOptions));
        if database_url == ":memory:" {
            builder = builder.max_size(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = builder.build(ConnectionManager::new(database_url))?;
        pool.get()?.batch_execute(SCHEMA)?;
        Ok(DB {
            pool: Arc::new(pool),
        })
    }

    /// Creates a campaign.
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<CampaignDetail> {
        self.transaction(move |conn| {
            let name = required("campaign_name", &new.name)?;
            if campaign_named(conn, &name)?.is_some() {
                return Err(ErrorKind::CampaignExists(name).into());
            }
            let template_id = match new.template_id {
                Some(id) => active_template_id(conn, id)?,
                None => None,
            };

            let now = now();
            diesel::insert_into(campaigns::table)
                .values((
                    campaigns::name.eq(&name),
                    campaigns::template_id.eq(template_id),
                    campaigns::custom_subject.eq(non_empty(new.custom_subject)),
                    campaigns::custom_message.eq(non_empty(new.custom_message)),
                    campaigns::use_custom_template.eq(new.use_custom_template),
                    campaigns::created_at.eq(now),
                    campaigns::updated_at.eq(now),
                ))
                .execute(conn)?;

            let campaign = campaigns::table
                .filter(campaigns::name.eq(&name))
                .select(Campaign::as_select())
                .first(conn)?;
            info!("Created campaign {} ({:?})", campaign.id, campaign.name);
            detail(conn, campaign)
        })
        .await
    }

    /// Lists every campaign, newest first.
    pub async fn list_campaigns(&self) -> Result<Vec<CampaignDetail>> {
        self.query(|conn| {
            let campaigns = campaigns::table
                .order((campaigns::created_at.desc(), campaigns::id.desc()))
                .select(Campaign::as_select())
                .load(conn)?;
            details(conn, campaigns)
        })
        .await
    }

    pub async fn get_campaign(&self, id: i32) -> Result<Campaign> {
        self.query(move |conn| find_campaign(conn, id)).await
    }

    pub async fn campaign_detail(&self, id: i32) -> Result<CampaignDetail> {
        self.query(move |conn| {
            let campaign = find_campaign(conn, id)?;
            detail(conn, campaign)
        })
        .await
    }

    /// Updates a campaign's name and send settings.
    pub async fn update_campaign(
        &self,
        id: i32,
        changes: CampaignChanges,
    ) -> Result<CampaignDetail> {
        self.transaction(move |conn| {
            let mut campaign = find_campaign(conn, id)?;

            if let Some(name) = changes.name {
                let name = required("campaign_name", &name)?;
                if name != campaign.name && campaign_named(conn, &name)?.is_some() {
                    return Err(ErrorKind::CampaignExists(name).into());
                }
                campaign.name = name;
            }
            if let Some(template_id) = changes.template_id {
                campaign.template_id = active_template_id(conn, template_id)?;
                if campaign.template_id.is_none() {
                    warn!(
                        "Campaign {} was given template {}, which isn't an active template",
                        id, template_id
                    );
                }
            }
            if let Some(subject) = changes.custom_subject {
                campaign.custom_subject = non_empty(Some(subject));
            }
            if let Some(message) = changes.custom_message {
                campaign.custom_message = non_empty(Some(message));
            }
            if let Some(use_custom_template) = changes.use_custom_template {
                campaign.use_custom_template = use_custom_template;
            }
            campaign.updated_at = now();

            diesel::update(campaigns::table.find(id))
                .set((
                    campaigns::name.eq(&campaign.name),
                    campaigns::template_id.eq(campaign.template_id),
                    campaigns::custom_subject.eq(&campaign.custom_subject),
                    campaigns::custom_message.eq(&campaign.custom_message),
                    campaigns::use_custom_template.eq(campaign.use_custom_template),
                    campaigns::updated_at.eq(campaign.updated_at),
                ))
                .execute(conn)?;
            detail(conn, campaign)
        })
        .await
    }

    /// Deletes a campaign, along with its recipients.
    pub async fn delete_campaign(&self, id: i32) -> Result<()> {
        self.query(move |conn| {
            let n = diesel::delete(campaigns::table.find(id)).execute(conn)?;
            if n == 0 {
                return Err(ErrorKind::CampaignNotFound(id).into());
            }
            info!("Deleted campaign {}", id);
            Ok(())
        })
        .await
    }

    /// Lists a campaign's recipients, in the order they were added.
    pub async fn list_recipients(&self, campaign_id: i32) -> Result<Vec<Recipient>> {
        self.query(move |conn| {
            find_campaign(conn, campaign_id)?;
            recipients::table
                .filter(recipients::campaign_id.eq(campaign_id))
                .order(recipients::id.asc())
                .select(Recipient::as_select())
                .load(conn)
                .map_err(Into::into)
        })
        .await
    }

    /// Adds a single recipient to a campaign.
    pub async fn add_recipient(&self, campaign_id: i32, new: NewRecipient) -> Result<Recipient> {
        self.transaction(move |conn| {
            find_campaign(conn, campaign_id)?;
            let address = required("email_address", &new.email_address)?;
            if !looks_like_address(&address) {
                return Err(ErrorKind::InvalidData(format!(
                    "{:?} is not an email address",
                    address
                ))
                .into());
            }
            if recipient_keys(conn, campaign_id)?.contains(&address_key(&address)) {
                return Err(ErrorKind::RecipientExists(address).into());
            }

            let recipient = NewRecipient {
                email_address: address,
                name: non_empty(new.name),
            };
            insert_recipients(conn, campaign_id, &[recipient.clone()])?;
            find_recipient(conn, campaign_id, &recipient.email_address)
        })
        .await
    }

    /// Changes the name a recipient is greeted with.
    pub async fn rename_recipient(
        &self,
        campaign_id: i32,
        address: String,
        name: Option<String>,
    ) -> Result<Recipient> {
        self.transaction(move |conn| {
            find_campaign(conn, campaign_id)?;
            let stored = stored_address(conn, campaign_id, &address)?;
            let target = recipients::table
                .filter(recipients::campaign_id.eq(campaign_id))
                .filter(recipients::email_address.eq(&stored));
            diesel::update(target)
                .set(recipients::name.eq(non_empty(name)))
                .execute(conn)?;
            find_recipient(conn, campaign_id, &stored)
        })
        .await
    }

    /// Removes a recipient from a campaign.
    pub async fn delete_recipient(&self, campaign_id: i32, address: String) -> Result<()> {
        self.transaction(move |conn| {
            find_campaign(conn, campaign_id)?;
            let stored = stored_address(conn, campaign_id, &address)?;
            let target = recipients::table
                .filter(recipients::campaign_id.eq(campaign_id))
                .filter(recipients::email_address.eq(&stored));
            diesel::delete(target).execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Creates a template, along with its variables.
    pub async fn create_template(&self, new: NewTemplate) -> Result<EmailTemplate> {
        self.transaction(move |conn| {
            let name = required("name", &new.name)?;
            let subject = required("subject", &new.subject)?;
            check_variables(&new.variables)?;

            let already_exists = diesel::select(diesel::dsl::exists(
                email_templates::table.filter(email_templates::name.eq(&name)),
            ))
            .get_result(conn)?;
            if already_exists {
                return Err(ErrorKind::TemplateExists(name).into());
            }

            let now = now();
            diesel::insert_into(email_templates::table)
                .values((
                    email_templates::name.eq(&name),
                    email_templates::description.eq(&new.description),
                    email_templates::subject.eq(&subject),
                    email_templates::body_kind.eq(new.body.kind()),
                    email_templates::body.eq(new.body.text()),
                    email_templates::css_styles.eq(&new.css_styles),
                    email_templates::is_active.eq(new.is_active),
                    email_templates::is_default.eq(new.is_default),
                    email_templates::created_at.eq(now),
                    email_templates::updated_at.eq(now),
                ))
                .execute(conn)?;
            let id = email_templates::table
                .filter(email_templates::name.eq(&name))
                .select(email_templates::id)
                .first(conn)?;
            insert_variables(conn, id, &new.variables)?;

            info!("Created template {} ({:?})", id, name);
            find_template(conn, id)
        })
        .await
    }

    /// Lists templates, newest first.
    pub async fn list_templates(&self, filter: TemplateFilter) -> Result<Vec<EmailTemplate>> {
        self.query(move |conn| {
            let mut query: email_templates::BoxedQuery<'static, Sqlite> =
                email_templates::table.into_boxed();
            if filter.active_only {
                query = query.filter(email_templates::is_active.eq(true));
            }
            if let Some(search) = filter.search.as_ref().map(|s| s.trim()) {
                if !search.is_empty() {
                    let pattern = like_pattern(search);
                    query = query.filter(
                        email_templates::name
                            .like(pattern.clone())
                            .escape('\\')
                            .or(email_templates::description.like(pattern).escape('\\')),
                    );
                }
            }

            let rows = query
                .order((email_templates::created_at.desc(), email_templates::id.desc()))
                .select(TemplateRow::as_select())
                .load(conn)?;
            with_variables(conn, rows)
        })
        .await
    }

    pub async fn get_template(&self, id: i32) -> Result<EmailTemplate> {
        self.query(move |conn| find_template(conn, id)).await
    }

    /// Updates a template. Variables, if given, replace the existing ones entirely.
    pub async fn update_template(
        &self,
        id: i32,
        changes: TemplateChanges,
    ) -> Result<EmailTemplate> {
        self.transaction(move |conn| {
            let current = find_template(conn, id)?;

            let name = match changes.name {
                Some(name) => {
                    let name = required("name", &name)?;
                    let taken = email_templates::table
                        .filter(email_templates::name.eq(&name))
                        .filter(email_templates::id.ne(id))
                        .select(email_templates::id)
                        .first::<i32>(conn)
                        .optional()?;
                    if taken.is_some() {
                        return Err(ErrorKind::TemplateExists(name).into());
                    }
                    name
                }
                None => current.name,
            };
            let subject = match changes.subject {
                Some(subject) => required("subject", &subject)?,
                None => current.subject,
            };
            let body = changes.body.unwrap_or(current.body);

            diesel::update(email_templates::table.find(id))
                .set((
                    email_templates::name.eq(&name),
                    email_templates::description
                        .eq(changes.description.unwrap_or(current.description)),
                    email_templates::subject.eq(&subject),
                    email_templates::body_kind.eq(body.kind()),
                    email_templates::body.eq(body.text()),
                    email_templates::css_styles
                        .eq(changes.css_styles.unwrap_or(current.css_styles)),
                    email_templates::is_active.eq(changes.is_active.unwrap_or(current.is_active)),
                    email_templates::is_default
                        .eq(changes.is_default.unwrap_or(current.is_default)),
                    email_templates::updated_at.eq(now()),
                ))
                .execute(conn)?;

            if let Some(variables) = changes.variables {
                check_variables(&variables)?;
                diesel::delete(
                    template_variables::table.filter(template_variables::template_id.eq(id)),
                )
                .execute(conn)?;
                insert_variables(conn, id, &variables)?;
            }

            find_template(conn, id)
        })
        .await
    }

    /// Deletes a template and its variables. Campaigns using it fall back to the default.
    pub async fn delete_template(&self, id: i32) -> Result<()> {
        self.query(move |conn| {
            let n = diesel::delete(email_templates::table.find(id)).execute(conn)?;
            if n == 0 {
                return Err(ErrorKind::TemplateNotFound(id).into());
            }
            info!("Deleted template {}", id);
            Ok(())
        })
        .await
    }

    /// Runs a query on a pooled connection, off the async executor.
    pub(crate) async fn query<F, T>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            func(&mut conn)
        })
        .await?
    }

    /// Like `query`, but inside a transaction that rolls back if `func` fails.
    pub(crate) async fn transaction<F, T>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.query(move |conn| conn.transaction(func)).await
    }
}

/// The key addresses are compared by: trimmed and lowercased.
pub fn address_key(address: &str) -> String {
    address.trim().to_lowercase()
}

/// The check uploaded and added addresses must pass.
pub fn looks_like_address(address: &str) -> bool {
    let address = address.trim();
    !address.is_empty() && address.contains('@')
}

pub(crate) fn find_campaign(conn: &mut SqliteConnection, id: i32) -> Result<Campaign> {
    campaigns::table
        .find(id)
        .select(Campaign::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ErrorKind::CampaignNotFound(id).into())
}

/// The keys of a campaign's current recipients.
pub(crate) fn recipient_keys(
    conn: &mut SqliteConnection,
    campaign_id: i32,
) -> Result<HashSet<String>> {
    let addresses = recipients::table
        .filter(recipients::campaign_id.eq(campaign_id))
        .select(recipients::email_address)
        .load::<String>(conn)?;
    Ok(addresses.iter().map(|a| address_key(a)).collect())
}

/// Inserts recipients in one statement. Callers are responsible for deduplication.
pub(crate) fn insert_recipients(
    conn: &mut SqliteConnection,
    campaign_id: i32,
    new: &[NewRecipient],
) -> Result<usize> {
    if new.is_empty() {
        return Ok(0);
    }
    let added_at = now();
    let rows = new
        .iter()
        .map(|r| NewRecipientRow {
            campaign_id,
            email_address: &r.email_address,
            name: r.name.as_deref(),
            added_at,
        })
        .collect::<Vec<_>>();
    let n = diesel::insert_into(recipients::table)
        .values(&rows)
        .execute(conn)?;
    Ok(n)
}

/// The address as stored for the recipient whose [`address_key`] matches `address`.
fn stored_address(conn: &mut SqliteConnection, campaign_id: i32, address: &str) -> Result<String> {
    let key = address_key(address);
    recipients::table
        .filter(recipients::campaign_id.eq(campaign_id))
        .select(recipients::email_address)
        .load::<String>(conn)?
        .into_iter()
        .find(|stored| address_key(stored) == key)
        .ok_or_else(|| ErrorKind::RecipientNotFound(address.trim().to_string()).into())
}

fn find_recipient(conn: &mut SqliteConnection, campaign_id: i32, address: &str) -> Result<Recipient> {
    recipients::table
        .filter(recipients::campaign_id.eq(campaign_id))
        .filter(recipients::email_address.eq(address))
        .select(Recipient::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ErrorKind::RecipientNotFound(address.to_string()).into())
}

fn find_template(conn: &mut SqliteConnection, id: i32) -> Result<EmailTemplate> {
    let row = email_templates::table
        .find(id)
        .select(TemplateRow::as_select())
        .first(conn)
        .optional()?
        .ok_or(ErrorKind::TemplateNotFound(id))?;
    let mut templates = with_variables(conn, vec![row])?;
    templates.pop().ok_or_else(|| ErrorKind::TemplateNotFound(id).into())
}

fn with_variables(conn: &mut SqliteConnection, rows: Vec<TemplateRow>) -> Result<Vec<EmailTemplate>> {
    let variables: Vec<VariableRow> = VariableRow::belonging_to(&rows)
        .select(VariableRow::as_select())
        .order(template_variables::id.asc())
        .load(conn)?;
    let grouped = variables.grouped_by(&rows);
    Ok(rows
        .into_iter()
        .zip(grouped)
        .map(|(row, variables)| EmailTemplate::from_rows(row, variables))
        .collect())
}

fn insert_variables(
    conn: &mut SqliteConnection,
    template_id: i32,
    variables: &[TemplateVariable],
) -> Result<()> {
    if variables.is_empty() {
        return Ok(());
    }
    let rows = variables
        .iter()
        .map(|v| {
            let variable_name = v.variable_name.trim();
            let display_name = match v.display_name.trim() {
                "" => variable_name,
                display_name => display_name,
            };
            NewVariableRow {
                template_id,
                variable_name,
                display_name,
                variable_type: v.variable_type.as_str(),
                default_value: v.default_value.as_deref(),
                is_required: v.is_required,
                description: &v.description,
            }
        })
        .collect::<Vec<_>>();
    diesel::insert_into(template_variables::table)
        .values(&rows)
        .execute(conn)?;
    Ok(())
}

fn check_variables(variables: &[TemplateVariable]) -> Result<()> {
    let mut seen = HashSet::new();
    for variable in variables {
        let name = variable.variable_name.trim();
        if name.is_empty() {
            return Err(ErrorKind::MissingParameter("variable_name").into());
        }
        if !seen.insert(name) {
            return Err(ErrorKind::InvalidData(format!("Duplicate variable {:?}", name)).into());
        }
    }
    Ok(())
}

/// The ID of the active template with the given ID, if there is one.
fn active_template_id(conn: &mut SqliteConnection, id: i32) -> Result<Option<i32>> {
    let id = email_templates::table
        .find(id)
        .filter(email_templates::is_active.eq(true))
        .select(email_templates::id)
        .first(conn)
        .optional()?;
    Ok(id)
}

fn campaign_named(conn: &mut SqliteConnection, name: &str) -> Result<Option<i32>> {
    let id = campaigns::table
        .filter(campaigns::name.eq(name))
        .select(campaigns::id)
        .first(conn)
        .optional()?;
    Ok(id)
}

fn detail(conn: &mut SqliteConnection, campaign: Campaign) -> Result<CampaignDetail> {
    let mut details = details(conn, vec![campaign])?;
    details
        .pop()
        .ok_or_else(|| ErrorKind::InvalidData("campaign vanished".to_string()).into())
}

fn details(conn: &mut SqliteConnection, campaigns: Vec<Campaign>) -> Result<Vec<CampaignDetail>> {
    let template_ids = campaigns
        .iter()
        .filter_map(|c| c.template_id)
        .collect::<Vec<_>>();
    let templates = email_templates::table
        .filter(email_templates::id.eq_any(template_ids))
        .select(TemplateSummary::as_select())
        .load(conn)?
        .into_iter()
        .map(|t| (t.id, t))
        .collect::<HashMap<_, _>>();

    let campaign_ids = campaigns.iter().map(|c| c.id).collect::<Vec<_>>();
    let counts = recipients::table
        .filter(recipients::campaign_id.eq_any(campaign_ids))
        .group_by(recipients::campaign_id)
        .select((recipients::campaign_id, count_star()))
        .load::<(i32, i64)>(conn)?
        .into_iter()
        .collect::<HashMap<_, _>>();

    Ok(campaigns
        .into_iter()
        .map(|campaign| CampaignDetail {
            custom_template: campaign
                .template_id
                .and_then(|id| templates.get(&id).cloned()),
            email_count: counts.get(&campaign.id).cloned().unwrap_or(0),
            campaign,
        })
        .collect())
}

fn required(param: &'static str, value: &str) -> Result<String> {
    match value.trim() {
        "" => Err(ErrorKind::MissingParameter(param).into()),
        value => Ok(value.to_string()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// A LIKE pattern matching `s` anywhere, with `\` as the escape character.
fn like_pattern(s: &str) -> String {
    let mut pattern = String::with_capacity(s.len() + 2);
    pattern.push('%');
    for c in s.chars() {
        if c == '%' || c == '_' || c == '\\' {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}
