//! Explicit sign-in context. The embedding app creates a [`Session`] after
//! OAuth and hands it to [`GmailClient::new`](crate::gmail::GmailClient::new);
//! nothing in the crate keeps a process-wide token.

const SERVICE: &str = "mailtiles";

#[derive(Clone)]
pub struct Session {
    account: String,
    access_token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

fn key_id(account: &str) -> String {
    format!("token-{account}")
}

fn entry(account: &str) -> Result<keyring::Entry, String> {
    let key = key_id(account);
    keyring::Entry::new(SERVICE, &key).map_err(|e| {
        log::error!("keyring Entry::new failed for key={key:?}: {e}");
        format!("keyring error: {e}")
    })
}

impl Session {
    pub fn new(account: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            access_token: access_token.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Look up a previously saved token. `Ok(None)` when nothing is stored.
    pub fn load(account: &str) -> Result<Option<Self>, String> {
        log::debug!("keyring GET: service={SERVICE:?} key={:?}", key_id(account));
        match entry(account)?.get_password() {
            Ok(token) => Ok(Some(Self::new(account, token))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                log::warn!("keyring get_password failed for {account:?}: {e}");
                Err(format!("keyring get: {e}"))
            }
        }
    }

    pub fn save(&self) -> Result<(), String> {
        log::debug!("keyring SET: service={SERVICE:?} key={:?}", key_id(&self.account));
        entry(&self.account)?
            .set_password(&self.access_token)
            .map_err(|e| {
                log::error!("keyring set_password failed for {:?}: {e}", self.account);
                format!("keyring set: {e}")
            })
    }

    /// Sign-out: drop the stored token. A missing entry is not an error.
    pub fn forget(account: &str) -> Result<(), String> {
        log::debug!("keyring DELETE: service={SERVICE:?} key={:?}", key_id(account));
        match entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                log::warn!("keyring delete failed for {account:?}: {e}");
                Err(format!("keyring delete: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_the_token() {
        let session = Session::new("me@example.com", "ya29.secret");
        let shown = format!("{session:?}");
        assert!(shown.contains("me@example.com"));
        assert!(!shown.contains("ya29.secret"));
        assert_eq!(session.bearer(), "Bearer ya29.secret");
    }
}
