use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};

use failure::{Backtrace, Context, Fail};
use warp::http::StatusCode;

/// A convenient alias for Result.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The kind of an application error.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    /// A required request parameter was not provided.
    #[fail(display = "{} is required", _0)]
    MissingParameter(&'static str),

    /// Invalid data was sent by the client.
    #[fail(display = "{}", _0)]
    InvalidData(String),

    /// A campaign was attempted to be created (or renamed), but the name is taken.
    #[fail(display = "Campaign with name {:?} already exists", _0)]
    CampaignExists(String),

    /// No campaign has the given ID.
    #[fail(display = "Campaign not found")]
    CampaignNotFound(i32),

    /// The campaign has no recipients to send to.
    #[fail(display = "No emails found for the given campaign.")]
    NoRecipients(i32),

    /// The address is already a recipient of the campaign.
    #[fail(display = "Email {:?} already exists in this campaign", _0)]
    RecipientExists(String),

    /// The address is not a recipient of the campaign.
    #[fail(display = "Email not found")]
    RecipientNotFound(String),

    /// A template was attempted to be created, but it already exists.
    #[fail(display = "Template {:?} already exists", _0)]
    TemplateExists(String),

    /// No (active, where it matters) custom template has the given ID.
    #[fail(display = "Template not found")]
    TemplateNotFound(i32),

    /// No built-in template has the given ID.
    #[fail(display = "Built-in template {} not found", _0)]
    BuiltinNotFound(u32),

    /// Template markup failed to compile, or names an unknown template file.
    #[fail(display = "Invalid template: {}", _0)]
    InvalidTemplate(String),

    /// The upload had no file part.
    #[fail(display = "No file uploaded")]
    NoFile,

    /// The uploaded file's extension is not an accepted spreadsheet format.
    #[fail(
        display = "Unsupported file format {:?}. Please upload a spreadsheet (xlsx, xls, ods or csv).",
        _0
    )]
    UnsupportedFileType(String),

    /// The uploaded spreadsheet could not be read.
    #[fail(display = "Could not read spreadsheet: {}", _0)]
    InvalidSpreadsheet(String),

    /// An error from Diesel.
    #[fail(display = "Diesel error: {}", _0)]
    Diesel(::diesel::result::Error),

    /// An error from R2D2.
    #[fail(display = "R2D2 error: {}", _0)]
    R2D2(::diesel::r2d2::PoolError),

    /// An invalid mailbox or address.
    #[fail(display = "Address error: {}", _0)]
    Address(::lettre::address::AddressError),

    /// An error from Lettre's message builder.
    #[fail(display = "Mail builder error: {}", _0)]
    Mail(::lettre::error::Error),

    /// An error from Lettre's SMTP transport.
    #[fail(display = "SMTP error: {}", _0)]
    Smtp(::lettre::transport::smtp::Error),

    /// An error from the Tera template engine, with its causes flattened.
    #[fail(display = "Template error: {}", _0)]
    Tera(String),

    /// An error reading CSV data.
    #[fail(display = "CSV error: {}", _0)]
    Csv(::csv::Error),

    /// An error deserializing JSON data.
    #[fail(display = "JSON error: {}", _0)]
    SerdeJson(::serde_json::error::Error),

    /// An error reading a multipart upload.
    #[fail(display = "Upload error: {}", _0)]
    Multipart(::warp::Error),

    /// An I/O error.
    #[fail(display = "I/O error: {}", _0)]
    Io(::std::io::Error),

    /// A blocking task panicked or was cancelled.
    #[fail(display = "Task error: {}", _0)]
    Join(::tokio::task::JoinError),
}

impl From<::diesel::result::Error> for ErrorKind {
    fn from(err: ::diesel::result::Error) -> ErrorKind {
        ErrorKind::Diesel(err)
    }
}

impl From<::diesel::r2d2::PoolError> for ErrorKind {
    fn from(err: ::diesel::r2d2::PoolError) -> ErrorKind {
        ErrorKind::R2D2(err)
    }
}

impl From<::lettre::address::AddressError> for ErrorKind {
    fn from(err: ::lettre::address::AddressError) -> ErrorKind {
        ErrorKind::Address(err)
    }
}

impl From<::lettre::error::Error> for ErrorKind {
    fn from(err: ::lettre::error::Error) -> ErrorKind {
        ErrorKind::Mail(err)
    }
}

impl From<::lettre::transport::smtp::Error> for ErrorKind {
    fn from(err: ::lettre::transport::smtp::Error) -> ErrorKind {
        ErrorKind::Smtp(err)
    }
}

impl From<::tera::Error> for ErrorKind {
    fn from(err: ::tera::Error) -> ErrorKind {
        ErrorKind::Tera(tera_message(&err))
    }
}

/// Flattens a Tera error. Tera keeps the useful part ("Variable `x` not found") in the source
/// chain, not in the top-level message.
pub(crate) fn tera_message(err: &::tera::Error) -> String {
    let mut msg = err.to_string();
    let mut cause = err.source();
    while let Some(err) = cause {
        msg.push_str(": ");
        msg.push_str(&err.to_string());
        cause = err.source();
    }
    msg
}

impl From<::csv::Error> for ErrorKind {
    fn from(err: ::csv::Error) -> ErrorKind {
        ErrorKind::Csv(err)
    }
}

impl From<::serde_json::error::Error> for ErrorKind {
    fn from(err: ::serde_json::error::Error) -> ErrorKind {
        ErrorKind::SerdeJson(err)
    }
}

impl From<::warp::Error> for ErrorKind {
    fn from(err: ::warp::Error) -> ErrorKind {
        ErrorKind::Multipart(err)
    }
}

impl From<::std::io::Error> for ErrorKind {
    fn from(err: ::std::io::Error) -> ErrorKind {
        ErrorKind::Io(err)
    }
}

impl From<::tokio::task::JoinError> for ErrorKind {
    fn from(err: ::tokio::task::JoinError) -> ErrorKind {
        ErrorKind::Join(err)
    }
}

/// An application error.
#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    /// The HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match *self.kind() {
            ErrorKind::MissingParameter(_)
            | ErrorKind::InvalidData(_)
            | ErrorKind::InvalidTemplate(_)
            | ErrorKind::NoFile
            | ErrorKind::UnsupportedFileType(_)
            | ErrorKind::InvalidSpreadsheet(_)
            | ErrorKind::Address(_)
            | ErrorKind::Csv(_)
            | ErrorKind::SerdeJson(_)
            | ErrorKind::Multipart(_) => StatusCode::BAD_REQUEST,

            // Name conflicts are reported as plain bad requests.
            ErrorKind::CampaignExists(_)
            | ErrorKind::RecipientExists(_)
            | ErrorKind::TemplateExists(_) => StatusCode::BAD_REQUEST,

            ErrorKind::CampaignNotFound(_)
            | ErrorKind::NoRecipients(_)
            | ErrorKind::RecipientNotFound(_)
            | ErrorKind::TemplateNotFound(_)
            | ErrorKind::BuiltinNotFound(_) => StatusCode::NOT_FOUND,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Display::fmt(&self.inner, f)
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl<E: Into<ErrorKind>> From<E> for Error {
    fn from(err: E) -> Error {
        Context::new(err.into()).into()
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
