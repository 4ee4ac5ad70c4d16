//! User-facing prompts for delegated sign-in flows.

use colored::Colorize;
use log::{debug, info};

/// Shows sign-in instructions to whoever is at the keyboard.
pub trait UserPrompt: Send + Sync {
    /// Device code flow: the provider's message plus the raw code and URL.
    fn device_code(&self, message: &str, user_code: &str, verification_uri: &str);

    /// Browser sign-in: show the URL and try to open it.
    fn open_browser(&self, url: &str);
}

/// Prints to stderr and launches the system browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompt;

impl UserPrompt for ConsolePrompt {
    fn device_code(&self, message: &str, user_code: &str, verification_uri: &str) {
        eprintln!();
        if message.is_empty() {
            eprintln!("To sign in, open {} and enter the code:", verification_uri.cyan());
        } else {
            eprintln!("{}", message);
        }
        eprintln!();
        eprintln!("    {}", user_code.bright_yellow().bold());
        eprintln!();

        if open::that(verification_uri).is_ok() {
            eprintln!("{}", "Browser opened. Complete sign-in there.".dimmed());
        }
    }

    fn open_browser(&self, url: &str) {
        eprintln!();
        eprintln!("Opening your browser to sign in. If it does not open, visit:");
        eprintln!("  {}", url.cyan());
        eprintln!();

        if let Err(e) = open::that(url) {
            debug!("Could not open browser: {}", e);
        }
    }
}

/// Logs instead of printing. For unattended runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentPrompt;

impl UserPrompt for SilentPrompt {
    fn device_code(&self, _message: &str, user_code: &str, verification_uri: &str) {
        info!("Device code {} issued for {}", user_code, verification_uri);
    }

    fn open_browser(&self, _url: &str) {
        info!("Browser sign-in requested but prompting is disabled");
    }
}
