/// URL endpoints and client identities for Google's Android login service
/// and the WhatsApp backup API.

/// Android account login (gpsoauth) endpoint.
pub const ANDROID_AUTH_URL: &str = "https://android.clients.google.com/auth";

/// Root of the backup-restore API that WhatsApp uses for Drive backups.
pub const BACKUP_API_ROOT: &str = "https://backup.googleapis.com/v1";

/// Shown to the user when Google demands a challenge without naming a URL.
pub const UNLOCK_CAPTCHA_URL: &str = "https://accounts.google.com/DisplayUnlockCaptcha";

pub const AUTH_USER_AGENT: &str = "GoogleAuth/1.4";

/// Signature of the Google Play Services APK, sent on master login.
pub const GMS_CLIENT_SIG: &str = "38918a453d07199354f8b19af05ec6562ced5788";

/// Signature of the WhatsApp APK, sent when requesting the Drive token.
pub const WHATSAPP_CLIENT_SIG: &str = "38a0f7d505fe18fec64fbf343ecaaaf310dbd799";

pub const WHATSAPP_APP: &str = "com.whatsapp";

/// OAuth scope granting access to the app-data folder holding the backup.
pub const DRIVE_APPDATA_SCOPE: &str = "oauth2:https://www.googleapis.com/auth/drive.appdata";

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub auth: String,
    pub backup_root: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth: ANDROID_AUTH_URL.to_string(),
            backup_root: BACKUP_API_ROOT.to_string(),
        }
    }
}

impl Endpoints {
    /// Point both services at a single base URL (test servers).
    #[cfg(test)]
    pub fn with_base(base: &str) -> Self {
        Self {
            auth: format!("{}/auth", base),
            backup_root: format!("{}/v1", base),
        }
    }
}
