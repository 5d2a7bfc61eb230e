use actix_multipart::{Field, Multipart};
use actix_web::{
    HttpResponse, delete, get,
    http::header::{Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue},
    post, put, web,
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::{
    AppState,
    auth::extract::{AdminUser, AuthUser},
    error::AppError,
    models::users::{ChangePasswordRequest, CreateUserRequest, LoginRequest, UserSummary},
};

pub fn register(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(format!("Invalid request body: {err}")).into()
    }))
    .service(health)
    .service(
        web::scope("/api")
            .service(login)
            .service(get_index)
            .service(rebuild_index)
            .service(browse)
            .service(download)
            .service(upload)
            .service(rename)
            .service(delete_path)
            .service(mkdir)
            .service(create_user)
            .service(list_users)
            .service(delete_user)
            .service(current_user)
            .service(change_password),
    );
}

#[get("/healthz")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "filebrowser-backend",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[post("/login")]
async fn login(
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    let response = state.auth.login(&body).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[get("/index")]
async fn get_index(_user: AuthUser, state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.index.snapshot().as_ref())
}

#[post("/index/rebuild")]
async fn rebuild_index(
    _user: AuthUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.index.rebuild().await?;
    Ok(ack("Index rebuilt successfully"))
}

#[get("/browse{path:(?:/.*)?}")]
async fn browse(
    _user: AuthUser,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let listing = state.files.browse(&path).await?;
    Ok(HttpResponse::Ok().json(listing))
}

#[get("/download{path:(?:/.*)?}")]
async fn download(
    _user: AuthUser,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let download = state.files.open_download(&path).await?;
    let disposition = attachment(download.file_name);

    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header(disposition)
        .no_chunking(download.len)
        .streaming(ReaderStream::new(download.file)))
}

#[post("/upload{path:(?:/.*)?}")]
async fn upload(
    _user: AuthUser,
    path: web::Path<String>,
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut uploaded = false;

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|err| AppError::BadRequest(format!("multipart error: {err}")))?
    {
        let content_disposition = field.content_disposition().clone();
        if uploaded || content_disposition.get_name() != Some("file") {
            // Ignore unknown fields
            drain_field(&mut field).await?;
            continue;
        }

        let file_name = content_disposition
            .get_filename()
            .map(str::to_string)
            .unwrap_or_default();
        if file_name.is_empty() {
            return Err(no_file_provided());
        }

        let mut pending = state.files.begin_upload(&path, &file_name).await?;
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|err| AppError::BadRequest(format!("failed to read upload: {err}")))?
        {
            pending.write_chunk(&chunk).await?;
        }
        state.files.finish_upload(pending).await?;
        uploaded = true;
    }

    if !uploaded {
        return Err(no_file_provided());
    }
    Ok(ack("File uploaded successfully"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameBody {
    new_name: String,
}

#[put("/rename{path:(?:/.*)?}")]
async fn rename(
    _user: AuthUser,
    path: web::Path<String>,
    state: web::Data<AppState>,
    body: web::Json<RenameBody>,
) -> Result<HttpResponse, AppError> {
    state.files.rename(&path, &body.new_name).await?;
    Ok(ack("File renamed successfully"))
}

#[delete("/delete{path:(?:/.*)?}")]
async fn delete_path(
    _user: AuthUser,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.files.delete(&path).await?;
    Ok(ack("File deleted successfully"))
}

#[derive(Deserialize)]
struct MkdirBody {
    name: String,
}

#[post("/mkdir{path:(?:/.*)?}")]
async fn mkdir(
    _user: AuthUser,
    path: web::Path<String>,
    state: web::Data<AppState>,
    body: web::Json<MkdirBody>,
) -> Result<HttpResponse, AppError> {
    state.files.mkdir(&path, &body.name).await?;
    Ok(ack("Directory created successfully"))
}

#[post("/users")]
async fn create_user(
    _admin: AdminUser,
    state: web::Data<AppState>,
    body: web::Json<CreateUserRequest>,
) -> Result<HttpResponse, AppError> {
    let user = state.auth.create_user(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(user))
}

#[get("/users")]
async fn list_users(
    _admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let users = state.auth.list_users().await?;
    Ok(HttpResponse::Ok().json(users))
}

#[delete("/users/{id}")]
async fn delete_user(
    _admin: AdminUser,
    id: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let id = id
        .parse::<i64>()
        .map_err(|_| AppError::BadRequest("Invalid user ID".into()))?;
    state.auth.delete_user(id).await?;
    Ok(ack("User deleted successfully"))
}

#[get("/me")]
async fn current_user(user: AuthUser) -> HttpResponse {
    let AuthUser(claims) = user;
    HttpResponse::Ok().json(UserSummary {
        id: claims.user_id,
        username: claims.username,
        is_admin: claims.is_admin,
    })
}

#[put("/me/password")]
async fn change_password(
    user: AuthUser,
    state: web::Data<AppState>,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, AppError> {
    state.auth.change_password(&user.0, &body).await?;
    Ok(ack("Password changed successfully"))
}

// Non-ASCII names get an ASCII fallback plus an RFC 5987 `filename*`.
fn attachment(file_name: String) -> ContentDisposition {
    let mut parameters = Vec::with_capacity(2);
    if file_name.is_ascii() {
        parameters.push(DispositionParam::Filename(file_name));
    } else {
        let fallback: String = file_name
            .chars()
            .map(|c| if c.is_ascii() { c } else { '_' })
            .collect();
        parameters.push(DispositionParam::Filename(fallback));
        parameters.push(DispositionParam::FilenameExt(ExtendedValue {
            charset: Charset::Ext("UTF-8".into()),
            language_tag: None,
            value: file_name.into_bytes(),
        }));
    }
    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters,
    }
}

fn ack(message: &str) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": message }))
}

fn no_file_provided() -> AppError {
    AppError::BadRequest("No file provided".into())
}

async fn drain_field(field: &mut Field) -> Result<(), AppError> {
    while field
        .try_next()
        .await
        .map_err(|err| AppError::BadRequest(format!("failed to read field: {err}")))?
        .is_some()
    {}
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_state(root: &std::path::Path) -> web::Data<AppState> {
    use crate::{fileops::FileOps, index::IndexHandle, sandbox::Sandbox};

    let root = std::fs::canonicalize(root).unwrap();
    let auth = crate::auth::test_service().await;
    auth.bootstrap_admin(Some("admin-pass")).await.unwrap();
    auth.create_user(CreateUserRequest {
        username: "viewer".into(),
        password: "viewer-pass".into(),
        is_admin: false,
    })
    .await
    .unwrap();

    let index = IndexHandle::start(root.clone()).await.unwrap();
    let files = FileOps::new(Sandbox::new(root), index.clone());
    web::Data::new(AppState { auth, files, index })
}
