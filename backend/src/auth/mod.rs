pub mod extract;
pub mod password;
pub mod store;
pub mod token;

use chrono::Utc;
use tokio::task;
use tracing::{info, warn};

use crate::{
    error::AppError,
    models::users::{
        ChangePasswordRequest, CreateUserRequest, LoginRequest, LoginResponse, NewUser, User,
    },
};

pub use password::Passwords;
pub use store::{DeleteOutcome, SqliteUserStore, UserRepository};
pub use token::{Claims, TokenSigner};

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const MIN_PASSWORD_LEN: usize = 6;

pub struct AuthService<R = SqliteUserStore> {
    store: R,
    signer: TokenSigner,
    passwords: Passwords,
    // Checked for unknown usernames too.
    dummy_hash: String,
}

impl<R: UserRepository> AuthService<R> {
    pub fn new(store: R, signer: TokenSigner, passwords: Passwords) -> Result<Self, AppError> {
        let dummy_hash = passwords.hash("dummy-password-for-unknown-users")?;
        Ok(Self {
            store,
            signer,
            passwords,
            dummy_hash,
        })
    }

    pub async fn bootstrap_admin(&self, password: Option<&str>) -> Result<Option<User>, AppError> {
        if self.store.count().await? > 0 {
            return Ok(None);
        }

        let password = match password {
            Some(password) => password,
            None => {
                warn!(
                    username = DEFAULT_ADMIN_USERNAME,
                    "using default admin password; set ADMIN_PASSWORD"
                );
                DEFAULT_ADMIN_PASSWORD
            }
        };

        let admin = self
            .store
            .create(NewUser {
                username: DEFAULT_ADMIN_USERNAME.into(),
                password_hash: self.hash_password(password).await?,
                is_admin: true,
            })
            .await?;
        info!(username = %admin.username, "created default admin user");
        Ok(Some(admin))
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, AppError> {
        if request.username.is_empty() || request.password.is_empty() {
            return Err(AppError::BadRequest(
                "username and password are required".into(),
            ));
        }

        let user = self.store.find_by_username(&request.username).await?;
        let stored_hash = user
            .as_ref()
            .map(|user| user.password_hash.clone())
            .unwrap_or_else(|| self.dummy_hash.clone());
        let matches = self.verify_password(&request.password, stored_hash).await?;

        let user = match user {
            Some(user) if matches => user,
            _ => {
                warn!(username = %request.username, "failed login");
                return Err(invalid_credentials());
            }
        };

        let token = self.signer.issue(&user, Utc::now())?;
        Ok(LoginResponse {
            token,
            user: user.summary(),
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AppError> {
        self.signer.verify(token, Utc::now())
    }

    pub async fn create_user(&self, request: CreateUserRequest) -> Result<User, AppError> {
        let username = request.username.trim();
        if username.is_empty() {
            return Err(AppError::BadRequest("username is required".into()));
        }
        check_password_length(&request.password)?;

        let user = self
            .store
            .create(NewUser {
                username: username.to_string(),
                password_hash: self.hash_password(&request.password).await?,
                is_admin: request.is_admin,
            })
            .await?;
        info!(username = %user.username, is_admin = user.is_admin, "user created");
        Ok(user)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, AppError> {
        self.store.list().await
    }

    pub async fn delete_user(&self, id: i64) -> Result<(), AppError> {
        match self.store.delete_unless_last_admin(id).await? {
            DeleteOutcome::Deleted => {
                info!(user_id = id, "user deleted");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(AppError::NotFound("User not found".into())),
            DeleteOutcome::LastAdmin => Err(AppError::BadRequest(
                "Cannot delete the last admin user".into(),
            )),
        }
    }

    pub async fn change_password(
        &self,
        claims: &Claims,
        request: &ChangePasswordRequest,
    ) -> Result<(), AppError> {
        check_password_length(&request.new_password)?;

        let user = self
            .store
            .find_by_id(claims.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))?;

        if !self
            .verify_password(&request.current_password, user.password_hash)
            .await?
        {
            return Err(AppError::BadRequest(
                "Current password is incorrect".into(),
            ));
        }

        let new_hash = self.hash_password(&request.new_password).await?;
        if !self.store.update_password(user.id, &new_hash).await? {
            return Err(AppError::NotFound("User not found".into()));
        }
        info!(user_id = user.id, "password changed");
        Ok(())
    }

    async fn hash_password(&self, plain: &str) -> Result<String, AppError> {
        let passwords = self.passwords.clone();
        let plain = plain.to_string();
        task::spawn_blocking(move || passwords.hash(&plain))
            .await
            .map_err(|err| AppError::Internal(format!("password hashing panicked: {err}")))?
    }

    async fn verify_password(&self, plain: &str, stored: String) -> Result<bool, AppError> {
        let passwords = self.passwords.clone();
        let plain = plain.to_string();
        task::spawn_blocking(move || passwords.verify(&plain, &stored))
            .await
            .map_err(|err| AppError::Internal(format!("password check panicked: {err}")))
    }
}

fn check_password_length(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("Invalid credentials".into())
}

#[cfg(test)]
pub(crate) async fn test_service() -> AuthService {
    let pool = crate::db::memory_pool().await;
    AuthService::new(
        SqliteUserStore::new(pool),
        TokenSigner::new("test-secret"),
        password::fast_passwords(),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_request(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.into(),
            password: password.into(),
        }
    }

    fn create_request(username: &str, password: &str, is_admin: bool) -> CreateUserRequest {
        CreateUserRequest {
            username: username.into(),
            password: password.into(),
            is_admin,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_admin_only_when_empty() {
        let auth = test_service().await;

        let admin = auth.bootstrap_admin(Some("s3cret!")).await.unwrap().unwrap();
        assert_eq!(admin.username, DEFAULT_ADMIN_USERNAME);
        assert!(admin.is_admin);

        assert!(auth.bootstrap_admin(Some("other")).await.unwrap().is_none());
        assert_eq!(auth.list_users().await.unwrap().len(), 1);

        auth.login(&login_request("admin", "s3cret!")).await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_uses_default_password() {
        let auth = test_service().await;
        auth.bootstrap_admin(None).await.unwrap();
        auth.login(&login_request("admin", DEFAULT_ADMIN_PASSWORD))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_issues_verifiable_token() {
        let auth = test_service().await;
        auth.bootstrap_admin(Some("s3cret!")).await.unwrap();

        let response = auth.login(&login_request("admin", "s3cret!")).await.unwrap();
        assert_eq!(response.user.username, "admin");
        assert!(response.user.is_admin);

        let claims = auth.verify_token(&response.token).unwrap();
        assert_eq!(claims.user_id, response.user.id);
        assert!(claims.is_admin);
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let auth = test_service().await;
        auth.bootstrap_admin(Some("s3cret!")).await.unwrap();

        let wrong_password = auth
            .login(&login_request("admin", "nope-nope"))
            .await
            .unwrap_err();
        let unknown_user = auth
            .login(&login_request("ghost", "s3cret!"))
            .await
            .unwrap_err();

        assert!(matches!(wrong_password, AppError::Unauthorized(_)));
        assert!(matches!(unknown_user, AppError::Unauthorized(_)));
        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
    }

    #[tokio::test]
    async fn test_repeated_failures_do_not_lock_account() {
        let auth = test_service().await;
        auth.bootstrap_admin(Some("s3cret!")).await.unwrap();

        for _ in 0..2 {
            let err = auth
                .login(&login_request("admin", "wrong-pass"))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Unauthorized(_)));
        }
        auth.login(&login_request("admin", "s3cret!")).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_user_validation() {
        let auth = test_service().await;

        let user = auth
            .create_user(create_request("bob", "password1", false))
            .await
            .unwrap();
        assert!(!user.is_admin);

        assert!(matches!(
            auth.create_user(create_request("bob", "password2", false)).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            auth.create_user(create_request("carol", "short", false)).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            auth.create_user(create_request("   ", "password1", false)).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_sole_admin_cannot_be_deleted() {
        let auth = test_service().await;
        let admin = auth.bootstrap_admin(Some("s3cret!")).await.unwrap().unwrap();
        auth.create_user(create_request("bob", "password1", false))
            .await
            .unwrap();

        let err = auth.delete_user(admin.id).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let users = auth.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users.iter().filter(|u| u.is_admin).count(), 1);
    }

    #[tokio::test]
    async fn test_delete_user() {
        let auth = test_service().await;
        auth.bootstrap_admin(Some("s3cret!")).await.unwrap();
        let bob = auth
            .create_user(create_request("bob", "password1", false))
            .await
            .unwrap();

        auth.delete_user(bob.id).await.unwrap();
        assert!(matches!(
            auth.delete_user(bob.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_change_password() {
        let auth = test_service().await;
        auth.bootstrap_admin(Some("s3cret!")).await.unwrap();
        let login = auth.login(&login_request("admin", "s3cret!")).await.unwrap();
        let claims = auth.verify_token(&login.token).unwrap();

        let wrong_current = ChangePasswordRequest {
            current_password: "not-it".into(),
            new_password: "brand-new".into(),
        };
        assert!(matches!(
            auth.change_password(&claims, &wrong_current).await,
            Err(AppError::BadRequest(_))
        ));

        let too_short = ChangePasswordRequest {
            current_password: "s3cret!".into(),
            new_password: "abc".into(),
        };
        assert!(matches!(
            auth.change_password(&claims, &too_short).await,
            Err(AppError::BadRequest(_))
        ));

        let valid = ChangePasswordRequest {
            current_password: "s3cret!".into(),
            new_password: "brand-new".into(),
        };
        auth.change_password(&claims, &valid).await.unwrap();

        assert!(auth.login(&login_request("admin", "s3cret!")).await.is_err());
        auth.login(&login_request("admin", "brand-new")).await.unwrap();
    }

    #[tokio::test]
    async fn test_change_password_for_deleted_user() {
        let auth = test_service().await;
        auth.bootstrap_admin(Some("s3cret!")).await.unwrap();
        let bob = auth
            .create_user(create_request("bob", "password1", false))
            .await
            .unwrap();
        let token = auth
            .login(&login_request("bob", "password1"))
            .await
            .unwrap()
            .token;
        let claims = auth.verify_token(&token).unwrap();
        auth.delete_user(bob.id).await.unwrap();

        let request = ChangePasswordRequest {
            current_password: "password1".into(),
            new_password: "password2".into(),
        };
        assert!(matches!(
            auth.change_password(&claims, &request).await,
            Err(AppError::NotFound(_))
        ));
    }
}
