use axum::extract::FromRequest;

use crate::error::AppError;

/// `Json` with rejections mapped onto [`AppError`]: a missing or wrong
/// content type is 415, a malformed body 400, both in the usual error shape.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct JsonBody<T>(pub T);
