//! Subcommand implementations.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use schooldesk_core::api::{ApiClient, ApiError, AuthApi};
use schooldesk_core::auth::token::decode_expiry;
use schooldesk_core::auth::{SessionManager, SessionState};
use schooldesk_core::config::Config;
use schooldesk_core::guard::{GuardDecision, MemoryNavigator, Navigator, RouteGuard, RouteTable};

pub const USERNAME_ENV: &str = "SCHOOLDESK_USERNAME";
pub const PASSWORD_ENV: &str = "SCHOOLDESK_PASSWORD";

/// Everything a command needs, built once from the config.
pub struct Context {
    config: Config,
    session: SessionManager,
    json: bool,
}

impl Context {
    pub fn new(api_url: Option<&str>, json: bool) -> Result<Self> {
        let mut config = Config::load()?;
        if let Some(url) = api_url {
            config.base_url = url.to_string();
        }

        let base_url = config.base_url()?;
        let store = config.credential_store()?;
        let auth = AuthApi::new(base_url, config.endpoints.clone(), config.request_timeout())
            .context("Failed to build HTTP client")?;
        debug!(base_url = %config.base_url, "Using backend");

        Ok(Self {
            session: SessionManager::new(auth, store),
            config,
            json,
        })
    }

    fn client(&self, navigator: Arc<dyn Navigator>) -> Result<ApiClient> {
        let client = ApiClient::new(
            self.config.base_url()?,
            self.config.endpoints.clone(),
            self.config.request_timeout(),
            self.session.clone(),
        )?;
        Ok(client.with_navigator(navigator))
    }

    fn print(&self, value: &Value, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_password(label: &str) -> Result<String> {
    Ok(rpassword::prompt_password(label)?)
}

pub async fn login(ctx: &Context, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| ctx.config.last_username.clone()) {
        Some(username) if !username.trim().is_empty() => username,
        _ => prompt("Username: ")?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => prompt_password("Password: ")?,
    };

    let user = ctx.session.login(&username, &password).await?;

    let mut config = ctx.config.clone();
    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to remember username");
    }

    let guard = RouteGuard::new(ctx.session.clone(), RouteTable::console());
    let sections = guard.visible_sections();
    let landing = guard.post_login_target(None);
    ctx.print(
        &json!({"user": user, "sections": sections, "landing": landing}),
        || {
            println!("Logged in as {} ({})", user.display_name, user.role);
            println!("Sections: {}", sections.join(", "));
        },
    )
}

pub fn logout(ctx: &Context) -> Result<()> {
    ctx.session.logout();
    ctx.print(&json!({"state": SessionState::Anonymous}), || {
        println!("Logged out");
    })
}

pub async fn whoami(ctx: &Context) -> Result<()> {
    ctx.session.restore().await;
    let Some(user) = ctx.session.user().filter(|_| ctx.session.is_authenticated()) else {
        bail!("Not logged in - run `schooldesk login`");
    };
    ctx.print(&json!(user), || {
        println!("{} ({})", user.display_name, user.role);
        if let Some(ref username) = user.username {
            println!("Username: {}", username);
        }
        println!("Id: {}", user.id);
    })
}

pub async fn status(ctx: &Context) -> Result<()> {
    let state = ctx.session.restore().await;
    let session = ctx.session.session();
    let expires_at = session.access_token.as_deref().and_then(decode_expiry);

    ctx.print(
        &json!({
            "state": state,
            "user": session.user,
            "has_refresh_token": session.refresh_token.is_some(),
            "access_token_expires_at": expires_at,
        }),
        || {
            println!("State: {:?}", state);
            if let Some(ref user) = session.user {
                println!("User: {} ({})", user.display_name, user.role);
            }
            match expires_at {
                Some(at) => {
                    let remaining = at - Utc::now();
                    println!("Access token expires {} ({} min)", at, remaining.num_minutes());
                }
                None if session.access_token.is_some() => println!("Access token expiry unknown"),
                None => {}
            }
            println!(
                "Refresh token: {}",
                if session.refresh_token.is_some() { "present" } else { "none" }
            );
        },
    )
}

pub async fn get(ctx: &Context, path: &str, open: Option<&str>, query: &[String]) -> Result<()> {
    let view = open.unwrap_or("/");
    let navigator = Arc::new(MemoryNavigator::new(view));
    ctx.session.restore().await;

    if let Some(view) = open {
        let guard = RouteGuard::new(ctx.session.clone(), RouteTable::console());
        match guard.resolve(view).await {
            GuardDecision::Render => {}
            GuardDecision::RedirectToLogin { from } => {
                bail!(
                    "{} requires a login - run `schooldesk login`, then open {}",
                    view,
                    guard.post_login_target(Some(&from))
                )
            }
            GuardDecision::RedirectToLanding { to } => {
                bail!("Your role cannot open {} (redirected to {})", view, to)
            }
            GuardDecision::Forbidden => bail!("Your role cannot open {}", view),
            GuardDecision::Loading => bail!("Session did not resolve"),
        }
    }

    let query: Vec<(&str, &str)> = query
        .iter()
        .map(|pair| pair.split_once('=').unwrap_or((pair.as_str(), "")))
        .collect();

    let client = ctx.client(navigator.clone())?;
    match client.get_with_query::<Value>(path, &query).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(ApiError::Unauthorized) => {
            for location in navigator.redirects() {
                eprintln!("Redirected to {}", location);
            }
            bail!(ApiError::Unauthorized)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn change_password(ctx: &Context) -> Result<()> {
    if !matches!(ctx.session.restore().await, SessionState::Authenticated) {
        bail!("Not logged in - run `schooldesk login`");
    }

    let current = prompt_password("Current password: ")?;
    let new = prompt_password("New password: ")?;
    let confirm = prompt_password("Confirm new password: ")?;
    if new != confirm {
        bail!("Passwords do not match");
    }
    if new.is_empty() {
        bail!("New password cannot be empty");
    }

    let client = ctx.client(Arc::new(MemoryNavigator::new("/perfil")))?;
    let message = client.change_password(&current, &new).await?;
    ctx.print(&json!({"message": message}), || println!("{}", message))
}
