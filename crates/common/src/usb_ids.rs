//! usb.ids hardware database
//!
//! Loads the line-oriented vendor/product name table most distros ship at
//! `/usr/share/hwdata/usb.ids`. The format: an unindented `VVVV  Name` line
//! opens a vendor block, a single-tab `\tPPPP  Name` line names a product
//! under the current vendor, `#` and blank lines are noise. Deeper-indented
//! lines (interface and class tables) are ignored, as are the trailing
//! class sections whose ids are not hex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Paths probed before falling back to the bundled copy.
pub const SYSTEM_DATABASE_PATHS: &[&str] =
    &["/usr/share/hwdata/usb.ids", "/usr/share/misc/usb.ids"];

#[derive(Debug, Clone)]
pub struct VendorEntry {
    pub name: String,
    pub devices: HashMap<u16, String>,
}

/// Parsed vendor/product name table.
#[derive(Debug, Clone, Default)]
pub struct UsbIdDatabase {
    vendors: HashMap<u16, VendorEntry>,
}

impl UsbIdDatabase {
    /// Load the system database, falling back to the bundled copy.
    ///
    /// Fails only if no source is readable; an incomplete or partially
    /// malformed file parses to whatever entries are valid.
    pub fn load(bundled_fallback: Option<&Path>) -> crate::Result<Self> {
        let mut candidates: Vec<PathBuf> =
            SYSTEM_DATABASE_PATHS.iter().map(PathBuf::from).collect();
        if let Some(path) = bundled_fallback {
            candidates.push(path.to_path_buf());
        }

        for path in &candidates {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let database = Self::parse(&content);
                    info!(
                        path = %path.display(),
                        vendors = database.vendor_count(),
                        "loaded USB id database"
                    );
                    return Ok(database);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "USB id database not readable");
                }
            }
        }

        Err(crate::Error::Database(format!(
            "no readable usb.ids source among {} candidates",
            candidates.len()
        )))
    }

    /// Parse database text into the vendor table.
    pub fn parse(content: &str) -> Self {
        let mut vendors: HashMap<u16, VendorEntry> = HashMap::new();
        let mut current_vendor: Option<u16> = None;

        for line in content.lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            if !line.starts_with('\t') {
                match parse_id_line(line) {
                    Some((id, name)) => {
                        vendors.insert(
                            id,
                            VendorEntry {
                                name,
                                devices: HashMap::new(),
                            },
                        );
                        current_vendor = Some(id);
                    }
                    // Trailing class/terminator sections start here; stop
                    // attributing product lines to the last real vendor.
                    None => current_vendor = None,
                }
            } else if !line[1..].starts_with('\t') {
                if let (Some(vendor_id), Some((id, name))) =
                    (current_vendor, parse_id_line(&line[1..]))
                    && let Some(vendor) = vendors.get_mut(&vendor_id)
                {
                    vendor.devices.insert(id, name);
                }
            }
        }

        Self { vendors }
    }

    pub fn vendor_name(&self, vendor_id: u16) -> Option<&str> {
        self.vendors.get(&vendor_id).map(|v| v.name.as_str())
    }

    pub fn product_name(&self, vendor_id: u16, product_id: u16) -> Option<&str> {
        self.vendors
            .get(&vendor_id)?
            .devices
            .get(&product_id)
            .map(String::as_str)
    }

    pub fn vendor_count(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }
}

/// Parse `VVVV<ws>Name` with exactly four hex digits.
fn parse_id_line(line: &str) -> Option<(u16, String)> {
    if line.len() < 5 || !line.is_char_boundary(4) {
        return None;
    }
    let (hex, rest) = line.split_at(4);
    let id = u16::from_str_radix(hex, 16).ok()?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let name = rest.trim();
    if name.is_empty() {
        return None;
    }
    Some((id, name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# usb.ids sample
#

046d  Logitech, Inc.
\tc52b  Unifying Receiver
\tc077  M105 Optical Mouse
\t\t deep indent ignored
05ac  Apple, Inc.
\t12a8  iPhone 5/5C/5S/6/SE/7/8/X/XR

C 00  (Defined at Interface level)
\t00  Undefined
";

    #[test]
    fn parses_vendors_and_products() {
        let db = UsbIdDatabase::parse(SAMPLE);
        assert_eq!(db.vendor_name(0x046d), Some("Logitech, Inc."));
        assert_eq!(db.product_name(0x046d, 0xc52b), Some("Unifying Receiver"));
        assert_eq!(db.product_name(0x046d, 0xc077), Some("M105 Optical Mouse"));
        assert_eq!(db.vendor_name(0x05ac), Some("Apple, Inc."));
    }

    #[test]
    fn unknown_ids_miss() {
        let db = UsbIdDatabase::parse(SAMPLE);
        assert_eq!(db.vendor_name(0xdead), None);
        assert_eq!(db.product_name(0x046d, 0xffff), None);
        assert_eq!(db.product_name(0xdead, 0xc52b), None);
    }

    #[test]
    fn class_sections_are_not_vendors() {
        let db = UsbIdDatabase::parse(SAMPLE);
        assert_eq!(db.vendor_count(), 2);
        // The "\t00  Undefined" line under "C 00" must not attach to Apple.
        assert_eq!(db.product_name(0x05ac, 0x0000), None);
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let db = UsbIdDatabase::parse("# only\n\n# comments\n");
        assert!(db.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let db = UsbIdDatabase::parse("zzzz  Not Hex\n046d\n046dNoSeparator\n");
        assert!(db.is_empty());
    }

    #[test]
    fn load_fails_when_nothing_readable() {
        let missing = Path::new("/nonexistent/usb.ids");
        // System paths may exist on a dev machine; only assert the
        // fallback-only contract when they do not.
        if SYSTEM_DATABASE_PATHS
            .iter()
            .all(|p| !Path::new(p).exists())
        {
            assert!(UsbIdDatabase::load(Some(missing)).is_err());
        }
    }

    #[test]
    fn load_uses_bundled_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usb.ids");
        std::fs::write(&path, SAMPLE).unwrap();
        if SYSTEM_DATABASE_PATHS
            .iter()
            .all(|p| !Path::new(p).exists())
        {
            let db = UsbIdDatabase::load(Some(&path)).unwrap();
            assert_eq!(db.vendor_name(0x046d), Some("Logitech, Inc."));
        }
    }
}
