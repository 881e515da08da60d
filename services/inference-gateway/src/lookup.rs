//! File-name conventions for brand checkpoints.
//!
//! Legacy directories hold loosely named files (`Audi_model_acc_90.89.safetensors`,
//! `Audi_model.safetensors`, `Audi_efficientnet_b3.safetensors`). They are searched
//! with a fixed, ordered list of strategies so the search order stays stable.

use std::path::{Path, PathBuf};

/// Maps a brand to its file-name stem: spaces, hyphens and slashes become `_`.
///
/// Not invertible: `"Land Rover"` and `"Land-Rover"` share a stem.
pub fn normalize_brand(brand: &str) -> String {
    brand.replace([' ', '-', '/'], "_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupStrategy {
    /// `prefix*suffix`, the wildcard may be empty.
    Wildcard { prefix: String, suffix: String },
    Exact(String),
}

impl LookupStrategy {
    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            Self::Exact(name) => file_name == name,
            Self::Wildcard { prefix, suffix } => {
                file_name.len() >= prefix.len() + suffix.len()
                    && file_name.starts_with(prefix.as_str())
                    && file_name.ends_with(suffix.as_str())
            }
        }
    }
}

/// Legacy search order for a normalized brand, highest priority first.
pub fn legacy_strategies(normalized: &str, extension: &str) -> Vec<LookupStrategy> {
    let suffix = format!(".{extension}");
    vec![
        LookupStrategy::Wildcard { prefix: format!("{normalized}_model_acc_"), suffix: suffix.clone() },
        LookupStrategy::Exact(format!("{normalized}_model{suffix}")),
        LookupStrategy::Wildcard { prefix: format!("{normalized}_"), suffix },
    ]
}

pub fn canonical_file_name(normalized: &str, architecture_tag: &str, extension: &str) -> String {
    format!("{normalized}_{architecture_tag}.{extension}")
}

/// Recovers the normalized brand from a canonical file name, if it is one.
pub fn brand_from_file_name(file_name: &str, architecture_tag: &str, extension: &str) -> Option<String> {
    let stem = file_name.strip_suffix(&format!(".{extension}"))?;
    let brand = stem.strip_suffix(&format!("_{architecture_tag}")).unwrap_or(stem);
    if brand.is_empty() { None } else { Some(brand.to_string()) }
}

/// First file in `dir` matched by the earliest strategy; ties go to the
/// lexicographically smallest name. A missing directory yields `None`.
pub fn find_first(dir: &Path, strategies: &[LookupStrategy]) -> std::io::Result<Option<PathBuf>> {
    let names = match sorted_file_names(dir) {
        Ok(names) => names,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for strategy in strategies {
        if let Some(name) = names.iter().find(|n| strategy.matches(n)) {
            return Ok(Some(dir.join(name)));
        }
    }
    Ok(None)
}

/// Regular files in `dir`, sorted by name.
pub fn sorted_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() { continue; }
        if let Some(name) = entry.file_name().to_str() { names.push(name.to_string()); }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_replaces_separators() {
        assert_eq!(normalize_brand("Land Rover"), "Land_Rover");
        assert_eq!(normalize_brand("Mercedes-Benz"), "Mercedes_Benz");
        assert_eq!(normalize_brand("A/B C-D"), "A_B_C_D");
        assert_eq!(normalize_brand("BMW"), "BMW");
    }

    #[test]
    fn strategies_keep_priority_order() {
        let s = legacy_strategies("Audi", "safetensors");
        assert_eq!(s.len(), 3);
        assert!(s[0].matches("Audi_model_acc_90.89.safetensors"));
        assert!(!s[0].matches("Audi_model.safetensors"));
        assert!(s[1].matches("Audi_model.safetensors"));
        assert!(s[2].matches("Audi_efficientnet_b3.safetensors"));
        assert!(!s[2].matches("Audi_efficientnet_b3.pth"));
        assert!(!s[2].matches("Audio_x.safetensors"));
    }

    #[test]
    fn wildcard_may_match_empty() {
        let w = LookupStrategy::Wildcard { prefix: "BMW_".into(), suffix: ".safetensors".into() };
        assert!(w.matches("BMW_.safetensors"));
        assert!(!w.matches("BMW.safetensors"));
    }

    #[test]
    fn brand_round_trips_through_canonical_name() {
        let name = canonical_file_name("Land_Rover", "efficientnet_b3", "safetensors");
        assert_eq!(name, "Land_Rover_efficientnet_b3.safetensors");
        assert_eq!(brand_from_file_name(&name, "efficientnet_b3", "safetensors").as_deref(), Some("Land_Rover"));
        assert_eq!(brand_from_file_name("Fiat.safetensors", "efficientnet_b3", "safetensors").as_deref(), Some("Fiat"));
        assert_eq!(brand_from_file_name("notes.txt", "efficientnet_b3", "safetensors"), None);
    }

    #[test]
    fn find_first_prefers_earlier_strategy() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Audi_efficientnet_b0.safetensors", "Audi_model.safetensors", "Audi_model_acc_91.safetensors", "Audi_model_acc_88.safetensors"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let hit = find_first(dir.path(), &legacy_strategies("Audi", "safetensors")).unwrap().unwrap();
        assert_eq!(hit.file_name().unwrap(), "Audi_model_acc_88.safetensors");

        std::fs::remove_file(dir.path().join("Audi_model_acc_88.safetensors")).unwrap();
        std::fs::remove_file(dir.path().join("Audi_model_acc_91.safetensors")).unwrap();
        let hit = find_first(dir.path(), &legacy_strategies("Audi", "safetensors")).unwrap().unwrap();
        assert_eq!(hit.file_name().unwrap(), "Audi_model.safetensors");
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert_eq!(find_first(&gone, &legacy_strategies("BMW", "safetensors")).unwrap(), None);
    }
}
