//! Email template rendering engine.
//!
//! Handlebars-based rendering with per-language template sets. A template is
//! registered under `(template_id, language)` and rendering falls back to the
//! default language when the requested one is missing.

use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::error::{EmailError, EmailResult};

/// Default language used when a request carries none, or when the requested
/// language has no registered set.
pub const DEFAULT_LANGUAGE: &str = "en";

/// The three renderable parts of an email template.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    /// Subject line template.
    pub subject: String,
    /// HTML body template.
    pub html: String,
    /// Plain text body template.
    pub text: String,
}

/// Rendered email content.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    /// Email subject line.
    pub subject: String,
    /// HTML body content.
    pub html: String,
    /// Plain text body content.
    pub text: String,
}

/// Template engine for rendering email templates.
pub struct TemplateRenderer {
    handlebars: Handlebars<'static>,
    default_language: String,
}

impl TemplateRenderer {
    /// Create a renderer with the built-in transactional templates
    /// registered under the default language.
    pub fn new() -> EmailResult<Self> {
        let mut renderer = Self::empty(DEFAULT_LANGUAGE);

        renderer.register(
            "welcome",
            DEFAULT_LANGUAGE,
            TemplateSet {
                subject: "Welcome, {{user_name}}!".to_string(),
                html: WELCOME_HTML_TEMPLATE.to_string(),
                text: WELCOME_TEXT_TEMPLATE.to_string(),
            },
        )?;

        renderer.register(
            "password_reset",
            DEFAULT_LANGUAGE,
            TemplateSet {
                subject: "Reset your password".to_string(),
                html: PASSWORD_RESET_HTML_TEMPLATE.to_string(),
                text: PASSWORD_RESET_TEXT_TEMPLATE.to_string(),
            },
        )?;

        Ok(renderer)
    }

    /// Create a renderer with no templates registered.
    pub fn empty(default_language: &str) -> Self {
        Self {
            handlebars: Handlebars::new(),
            default_language: default_language.to_string(),
        }
    }

    /// Register a template set for `(template_id, language)`. Replaces any
    /// previously registered set for the same pair.
    pub fn register(
        &mut self,
        template_id: &str,
        language: &str,
        set: TemplateSet,
    ) -> EmailResult<()> {
        for (part, source) in [
            ("subject", &set.subject),
            ("html", &set.html),
            ("text", &set.text),
        ] {
            let name = Self::key(template_id, language, part);
            self.handlebars
                .register_template_string(&name, source)
                .map_err(|e| {
                    EmailError::Template(format!("Failed to register {}: {}", name, e))
                })?;
        }
        Ok(())
    }

    /// Whether `(template_id, language)` has a registered set.
    pub fn has_template(&self, template_id: &str, language: &str) -> bool {
        self.handlebars
            .has_template(&Self::key(template_id, language, "subject"))
    }

    /// Render a template in the requested language, falling back to the
    /// default language when the requested one is missing.
    pub fn render<T: Serialize>(
        &self,
        template_id: &str,
        language: Option<&str>,
        variables: &T,
    ) -> EmailResult<RenderedEmail> {
        let requested = language.unwrap_or(&self.default_language);
        let language = if self.has_template(template_id, requested) {
            requested
        } else if self.has_template(template_id, &self.default_language) {
            debug!(
                template_id = %template_id,
                requested = %requested,
                fallback = %self.default_language,
                "Falling back to default template language"
            );
            &self.default_language
        } else {
            return Err(EmailError::Template(format!(
                "Unknown template '{}'",
                template_id
            )));
        };

        Ok(RenderedEmail {
            subject: self.render_part(template_id, language, "subject", variables)?,
            html: self.render_part(template_id, language, "html", variables)?,
            text: self.render_part(template_id, language, "text", variables)?,
        })
    }

    fn render_part<T: Serialize>(
        &self,
        template_id: &str,
        language: &str,
        part: &str,
        variables: &T,
    ) -> EmailResult<String> {
        self.handlebars
            .render(&Self::key(template_id, language, part), variables)
            .map_err(|e| EmailError::Template(e.to_string()))
    }

    fn key(template_id: &str, language: &str, part: &str) -> String {
        format!("{}:{}:{}", template_id, language, part)
    }
}

// ============================================================================
// Built-in templates
// ============================================================================

const WELCOME_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 24px; font-weight: 600; margin: 0 0 16px 0; text-align: center;">
          Welcome, {{user_name}}!
        </h1>
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 24px 0; text-align: center;">
          Thanks for joining us. Your account has been created successfully.
        </p>
        <table width="100%" cellspacing="0" cellpadding="0">
          <tr>
            <td style="text-align: center;">
              <a href="{{dashboard_url}}" style="display: inline-block; background-color: #2563eb; color: #ffffff; font-size: 16px; font-weight: 500; padding: 12px 32px; text-decoration: none; border-radius: 6px;">
                Go to Dashboard
              </a>
            </td>
          </tr>
        </table>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const WELCOME_TEXT_TEMPLATE: &str = r#"Welcome, {{user_name}}!

Thanks for joining us. Your account has been created successfully.

Go to your dashboard: {{dashboard_url}}"#;

const PASSWORD_RESET_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 24px; font-weight: 600; margin: 0 0 16px 0; text-align: center;">
          Reset your password
        </h1>
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 24px 0; text-align: center;">
          Hi {{user_name}}, we received a request to reset your password.
        </p>
        <table width="100%" cellspacing="0" cellpadding="0">
          <tr>
            <td style="text-align: center;">
              <a href="{{reset_url}}" style="display: inline-block; background-color: #dc2626; color: #ffffff; font-size: 16px; font-weight: 500; padding: 12px 32px; text-decoration: none; border-radius: 6px;">
                Reset Password
              </a>
            </td>
          </tr>
        </table>
        <p style="color: #71717a; font-size: 12px; text-align: center; margin: 16px 0 0 0;">
          This link expires in {{expiry_hours}} hour(s). If you didn't request this, you can safely ignore this email.
        </p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const PASSWORD_RESET_TEXT_TEMPLATE: &str = r#"Reset your password

Hi {{user_name}},

We received a request to reset your password. Click the link below to create a new password:

{{reset_url}}

This link expires in {{expiry_hours}} hour(s). If you didn't request this, you can safely ignore this email."#;
