//! Connected-users summary: the text returned by LIST.
//!
//! The summary starts as `[LIST]` and holds one ` name` token per connected
//! user, in connection order. It has its own lock, independent of the
//! session lock table.

use tokio::sync::Mutex;

/// Prefix of every LIST reply.
pub const LIST_PREFIX: &str = "[LIST]";

/// Shared, lock-protected LIST text.
#[derive(Debug)]
pub struct ConnectedSummary {
    text: Mutex<String>,
}

impl Default for ConnectedSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectedSummary {
    pub fn new() -> Self {
        Self {
            text: Mutex::new(LIST_PREFIX.to_string()),
        }
    }

    /// Appends `username` to the summary.
    pub async fn add(&self, username: &str) {
        let mut text = self.text.lock().await;
        text.push(' ');
        text.push_str(username);
    }

    /// Removes the token matching `username` exactly.
    ///
    /// Names that merely contain `username` are left alone. Returns false
    /// if the name was not listed.
    pub async fn remove(&self, username: &str) -> bool {
        let mut text = self.text.lock().await;
        let mut found = false;
        let mut rebuilt = String::with_capacity(text.len());
        rebuilt.push_str(LIST_PREFIX);

        let names = text.strip_prefix(LIST_PREFIX).unwrap_or(text.as_str());
        for name in names.split_whitespace() {
            if !found && name == username {
                found = true;
                continue;
            }
            rebuilt.push(' ');
            rebuilt.push_str(name);
        }

        if found {
            *text = rebuilt;
        }
        found
    }

    /// Current LIST text.
    pub async fn snapshot(&self) -> String {
        self.text.lock().await.clone()
    }

    /// Resets to an empty list.
    pub async fn clear(&self) {
        let mut text = self.text.lock().await;
        text.clear();
        text.push_str(LIST_PREFIX);
    }
}
