use std::sync::OnceLock;

use mac_oui::Oui;
use tracing::warn;

static OUI_DB: OnceLock<Option<Oui>> = OnceLock::new();

fn oui_db() -> Option<&'static Oui> {
    OUI_DB
        .get_or_init(|| match Oui::default() {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(error = %e, "failed to load OUI database, vendor lookup disabled");
                None
            }
        })
        .as_ref()
}

/// Manufacturer registered for the OUI prefix of `mac`.
pub fn lookup(mac: &str) -> Option<String> {
    match oui_db()?.lookup_by_mac(mac) {
        Ok(Some(entry)) => Some(entry.company_name.clone()),
        _ => None,
    }
}
