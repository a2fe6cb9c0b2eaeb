use std::io::{self, Write};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::warn;

use studyhub_core::api::Method;
use studyhub_core::auth::{login_error_message, LandingReason};
use studyhub_core::{Config, Session, SessionEvent};

/// Environment variable for non-interactive logins
const PASSWORD_ENV: &str = "STUDYHUB_PASSWORD";

pub async fn login(session: &Session, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(last_user) => prompt_with_default("Username", &last_user)?,
        None => prompt("Username")?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ")?,
    };

    println!("Authenticating...");
    let outcome = match session.login(&username, &password).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(anyhow::anyhow!(login_error_message(&e))),
    };

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {}.", outcome.user.display_name());

    if outcome.require_password_change {
        println!("\nYour password was issued by an administrator and must be changed.");
        change_initial_password(session).await?;
    }
    Ok(())
}

async fn change_initial_password(session: &Session) -> Result<()> {
    let new_password = rpassword::prompt_password("New password: ")?;
    let confirmation = rpassword::prompt_password("Confirm new password: ")?;

    let message = session
        .set_initial_password(&new_password, &confirmation)
        .await
        .context("Password change failed")?;

    if message.is_empty() {
        println!("Password changed.");
    } else {
        println!("{}", message);
    }
    Ok(())
}

pub async fn logout(session: &Session) -> Result<()> {
    session.logout().await;
    println!("Signed out.");
    Ok(())
}

pub fn whoami(session: &Session) -> Result<()> {
    match session.current_user() {
        Some(user) => {
            println!("{} (id {})", user.display_name(), user.subject_id);
            if user.is_admin() {
                println!("Role: administrator");
            } else if user.is_staff() {
                println!("Role: staff");
            }
            println!("Access expires in {} min", user.minutes_until_expiry());
        }
        None => println!("Not signed in. Run `studyhub login`."),
    }
    Ok(())
}

pub async fn request(session: &Session, method: &str, path: &str, body: Option<&str>) -> Result<()> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let body = body
        .map(serde_json::from_str)
        .transpose()
        .context("Request body is not valid JSON")?;

    let response = session.client().request(method, path, body).await?;
    let status = response.status();
    let text = response.text().await.context("Failed to read response body")?;

    eprintln!("{}", status);
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}

/// Tell the user when the session ended behind their back.
pub fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::LandingRequired { reason } = event {
            let why = match reason {
                LandingReason::StoredCredentialExpired => "your session expired".to_string(),
                LandingReason::StoredCredentialInvalid => "the saved session was unreadable".to_string(),
                LandingReason::RenewalFailed(e) => format!("it could not be renewed ({})", e),
            };
            eprintln!("You have been signed out because {}. Run `studyhub login`.", why);
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_with_default(label: &str, default: &str) -> Result<String> {
    let input = prompt(&format!("{} [{}]", label, default))?;
    if input.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input)
    }
}
