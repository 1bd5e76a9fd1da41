use std::sync::Arc;
use std::time::Duration;

use base32::Alphabet;
use uuid::Uuid;

use crate::driver::{Driver, Query};
use crate::error::Result;

/// Well-known key serialising all directory mutations of one application.
const DIRECTORY_LOCK_KEY: &str = "100";
const DIRECTORY_LOCK_TTL: Duration = Duration::from_secs(10);
const DIRECTORY_RETRY_CAP: Duration = Duration::from_millis(100);

/// Suffix marking a base32-encoded name component.
const ENCODED_SUFFIX: &str = "w32";

const BASE32: Alphabet = Alphabet::Rfc4648Hex { padding: false };

/// Turns an arbitrary string into a back-end-legal name component.
///
/// Strings that are already plain (`^[a-z][a-z0-9_]*$`, not ending in the
/// encoding suffix) pass through; everything else becomes the lowercase
/// unpadded base32 form of its UTF-8 bytes, marked with the suffix.
pub fn sanitise(s: &str) -> String {
    if is_plain(s) {
        s.to_string()
    } else {
        let mut encoded = base32::encode(BASE32, s.as_bytes()).to_lowercase();
        encoded.push_str(ENCODED_SUFFIX);
        encoded
    }
}

/// Undoes [`sanitise`]. Returns `None` when the component carries the
/// encoding suffix but does not decode to UTF-8 text.
pub fn restore(component: &str) -> Option<String> {
    match component.strip_suffix(ENCODED_SUFFIX) {
        None => Some(component.to_string()),
        Some(encoded) => {
            let bytes = base32::decode(BASE32, &encoded.to_uppercase())?;
            String::from_utf8(bytes).ok()
        }
    }
}

fn is_plain(s: &str) -> bool {
    let mut chars = s.chars();
    let first_ok = matches!(chars.next(), Some('a'..='z'));
    first_ok
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
        && !s.ends_with(ENCODED_SUFFIX)
}

/// The application's category directory index: UUID -> original name.
pub fn directory_index(app_code: &str) -> String {
    format!("{}__indices", sanitise(app_code))
}

/// The application's per-category locales index.
pub fn locales_index(app_code: &str) -> String {
    format!("{}__locales", sanitise(app_code))
}

/// Derives the internal index name for a category.
///
/// The sanitised `app_code + "_" + name` candidate is used directly when it
/// fits the driver's limit. Otherwise the category is registered in the
/// directory index under a UUID, guarded by the directory lease so that two
/// clients racing on the same new name agree on one UUID.
pub fn index_name(driver: &Arc<dyn Driver>, app_code: &str, category: &str) -> Result<String> {
    let app = sanitise(app_code);
    let candidate = format!("{app}_{}", sanitise(category));
    if candidate.len() <= driver.max_index_name_len() {
        return Ok(candidate);
    }

    let directory = directory_index(app_code);
    lock_directory(driver, &directory)?;

    let id = match scan_directory(driver, &directory, category) {
        Ok(Some(existing)) => {
            driver.unlock(DIRECTORY_LOCK_KEY, &directory)?;
            existing
        }
        Ok(None) => {
            let id = Uuid::new_v4().simple().to_string();
            let unlock_driver = Arc::clone(driver);
            let unlock_index = directory.clone();
            // the lease is released only once the directory entry is durable
            driver.put_primary(
                &id,
                &directory,
                category.as_bytes().to_vec(),
                Box::new(|| {}),
                Box::new(move || {
                    if let Err(e) = unlock_driver.unlock(DIRECTORY_LOCK_KEY, &unlock_index) {
                        tracing::error!(error = %e, "failed to release directory lease");
                    }
                }),
            )?;
            id
        }
        Err(e) => {
            driver.unlock(DIRECTORY_LOCK_KEY, &directory)?;
            return Err(e);
        }
    };

    Ok(format!("{app}_{id}"))
}

/// Recovers the user category name from an internal index name, or `None`
/// when the index does not belong to this application (wrong prefix, or one
/// of the `__`-system indices).
pub fn category_name(
    driver: &Arc<dyn Driver>,
    app_code: &str,
    index: &str,
) -> Result<Option<String>> {
    let prefix = format!("{}_", sanitise(app_code));
    let Some(rest) = index.strip_prefix(&prefix) else {
        return Ok(None);
    };
    if rest.starts_with('_') {
        return Ok(None);
    }

    // a directory hit means the remainder was a minted UUID
    if let Some(bytes) = driver.get(rest, &directory_index(app_code))? {
        return Ok(Some(String::from_utf8(bytes)?));
    }

    Ok(restore(rest))
}

fn lock_directory(driver: &Arc<dyn Driver>, directory: &str) -> Result<()> {
    loop {
        let hint = driver.try_lock(DIRECTORY_LOCK_KEY, directory, DIRECTORY_LOCK_TTL)?;
        if hint <= 0 {
            return Ok(());
        }
        let wait = Duration::from_millis(hint as u64).min(DIRECTORY_RETRY_CAP);
        std::thread::sleep(wait);
    }
}

fn scan_directory(
    driver: &Arc<dyn Driver>,
    directory: &str,
    category: &str,
) -> Result<Option<String>> {
    let mut found = None;
    // consume the whole sequence so the driver closes its cursor
    for key in driver.list(directory, &Query::default())? {
        if let Some(bytes) = driver.get(&key, directory)? {
            if bytes == category.as_bytes() {
                found = Some(key);
            }
        }
    }
    Ok(found)
}
