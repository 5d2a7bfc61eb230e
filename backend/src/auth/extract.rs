use actix_web::{FromRequest, HttpRequest, dev::Payload, http::header, web};
use futures_util::future::{Ready, ready};
use tracing::debug;

use crate::{AppState, auth::Claims, error::AppError};

#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

#[derive(Debug, Clone)]
pub struct AdminUser(pub Claims);

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req).map(AuthUser))
    }
}

impl FromRequest for AdminUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let result = authenticate(req).and_then(|claims| {
            if claims.is_admin {
                Ok(AdminUser(claims))
            } else {
                debug!(username = %claims.username, "non-admin on admin route");
                Err(AppError::Forbidden("Admin access required".into()))
            }
        });
        ready(result)
    }
}

fn authenticate(req: &HttpRequest) -> Result<Claims, AppError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or_else(|| AppError::Internal("application state is not configured".into()))?;

    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("Authorization header required".into()))?;
    let raw = value.to_str().map_err(|_| AppError::invalid_token())?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();

    state.auth.verify_token(token)
}
