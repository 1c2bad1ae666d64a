//! The HTTP API.

mod endpoints;

use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reject::{InvalidQuery, LengthRequired, MethodNotAllowed, PayloadTooLarge};
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::mailer::Transport;
use crate::render::Renderer;
use crate::util::log_err;
use crate::{Result, DB};

use self::endpoints::Params;

/// The largest accepted JSON request body, in bytes.
pub const MAX_JSON_BODY: u64 = 1024 * 1024;

/// Everything the endpoints need. Cheaply clonable.
#[derive(Clone)]
pub struct State {
    pub db: DB,
    pub renderer: Arc<Renderer>,
    pub dispatcher: Dispatcher,
    pub config: Arc<Config>,
}

impl State {
    pub fn new(
        db: DB,
        renderer: Arc<Renderer>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> State {
        let dispatcher = Dispatcher::new(
            db.clone(),
            renderer.clone(),
            transport,
            config.dispatch.clone(),
        );
        State {
            db,
            renderer,
            dispatcher,
            config: Arc::new(config),
        }
    }
}

/// Returns all the routes.
pub fn routes(state: State) -> BoxedFilter<(Response,)> {
    // Leaves room for the multipart framing around the file itself.
    let max_upload = state.config.import.max_upload_bytes.saturating_add(64 * 1024);
    let state = warp::any().map(move || state.clone());
    let params = warp::query::<Params>();
    let body = warp::body::content_length_limit(MAX_JSON_BODY).and(warp::body::bytes());

    let campaigns = warp::path!("campaigns")
        .and(warp::get())
        .and(state.clone())
        .then(endpoints::list_campaigns)
        .map(respond)
        .or(warp::path!("campaigns" / "create")
            .and(warp::post())
            .and(state.clone())
            .and(body)
            .then(endpoints::create_campaign)
            .map(respond))
        .unify()
        .or(warp::path!("update-campaign")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .then(endpoints::rename_campaign)
            .map(respond))
        .unify()
        .or(warp::path!("campaigns" / "template-update")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .and(body)
            .then(endpoints::update_campaign)
            .map(respond))
        .unify()
        .or(warp::path!("delete-campaign")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .then(endpoints::delete_campaign)
            .map(respond))
        .unify()
        .or(warp::path!("send-emails")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .and(body)
            .then(endpoints::send_emails)
            .map(respond))
        .unify()
        .or(warp::path!("campaigns" / "send-enhanced")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .and(body)
            .then(endpoints::send_enhanced)
            .map(respond))
        .unify()
        .boxed();

    let recipients = warp::path!("upload-xls")
        .and(warp::post())
        .and(state.clone())
        .and(params)
        .and(warp::multipart::form().max_length(max_upload))
        .then(endpoints::upload)
        .map(respond)
        .or(warp::path!("list-emails")
            .and(warp::get())
            .and(state.clone())
            .and(params)
            .then(endpoints::list_emails)
            .map(respond))
        .unify()
        .or(warp::path!("add-email")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .and(body)
            .then(endpoints::add_email)
            .map(respond))
        .unify()
        .or(warp::path!("update-email")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .and(body)
            .then(endpoints::update_email)
            .map(respond))
        .unify()
        .or(warp::path!("delete-email")
            .and(warp::post())
            .and(state.clone())
            .and(params)
            .then(endpoints::delete_email)
            .map(respond))
        .unify()
        .boxed();

    let templates = warp::path!("templates")
        .and(warp::get())
        .and(state.clone())
        .and(params)
        .then(endpoints::list_templates)
        .map(respond)
        .or(warp::path!("templates" / "create")
            .and(warp::post())
            .and(state.clone())
            .and(body)
            .then(endpoints::create_template)
            .map(respond))
        .unify()
        .or(warp::path!("templates" / "preview")
            .and(warp::post())
            .and(state.clone())
            .and(body)
            .then(endpoints::preview_template)
            .map(respond))
        .unify()
        .or(warp::path!("template-preview")
            .and(warp::get())
            .and(state.clone())
            .and(params)
            .then(endpoints::sample_preview)
            .map(respond))
        .unify()
        .or(warp::path!("templates" / i32)
            .and(warp::get())
            .and(state.clone())
            .then(endpoints::get_template)
            .map(respond))
        .unify()
        .or(warp::path!("templates" / i32)
            .and(warp::put())
            .and(state.clone())
            .and(body)
            .then(endpoints::update_template)
            .map(respond))
        .unify()
        .or(warp::path!("templates" / i32)
            .and(warp::delete())
            .and(state)
            .then(endpoints::delete_template)
            .map(respond))
        .unify()
        .boxed();

    let status = warp::path!("status")
        .and(warp::get())
        .map(|| reply::with_status(reply::reply(), StatusCode::NO_CONTENT).into_response());

    campaigns
        .or(recipients)
        .unify()
        .or(templates)
        .unify()
        .or(status)
        .unify()
        .recover(recover)
        .unify()
        .boxed()
}

/// Turns an endpoint's result into a response, logging failures.
fn respond(result: Result<Response>) -> Response {
    match result {
        Ok(res) => res,
        Err(err) => {
            let status = err.status();
            let msg = err.to_string();
            if status.is_server_error() {
                log_err(err.into());
            } else {
                info!("Rejected request ({}): {}", status, msg);
            }
            error_reply(status, msg)
        }
    }
}

fn json_reply<T: Serialize>(status: StatusCode, body: &T) -> Response {
    reply::with_status(reply::json(body), status).into_response()
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_reply(status: StatusCode, error: String) -> Response {
    json_reply(status, &ErrorBody { error })
}

/// Reports requests no route accepted in the same shape as endpoint errors.
async fn recover(err: Rejection) -> ::std::result::Result<Response, Infallible> {
    let (status, msg) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
        )
    } else if err.find::<PayloadTooLarge>().is_some() {
        (
            StatusCode::BAD_REQUEST,
            "The request body is too large".to_string(),
        )
    } else if err.find::<LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "A Content-Length header is required".to_string(),
        )
    } else if let Some(e) = err.find::<InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        debug!("Unhandled rejection: {:?}", err);
        (StatusCode::BAD_REQUEST, "Bad request".to_string())
    };
    Ok(error_reply(status, msg))
}
