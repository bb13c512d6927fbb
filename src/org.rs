/// Organization allow-list.
///
/// Matching is a case-insensitive substring test of each entry against the
/// session's organization (for the portal that is the organization's portal
/// host, e.g. `cityofportland.maps.arcgis.com`). Blank entries are dropped, and
/// a list with no entries left imposes no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationAllowList {
    entries: Vec<String>,
}

impl OrganizationAllowList {
    #[must_use]
    pub fn new<I, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    /// Whether any organization restriction is configured.
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Checks an organization against the list.
    ///
    /// Always true when unrestricted. A missing organization never passes a
    /// restricted list.
    #[must_use]
    pub fn permits(&self, organization: Option<&str>) -> bool {
        if !self.is_restricted() {
            return true;
        }
        let Some(organization) = organization else {
            return false;
        };
        let organization = organization.to_lowercase();
        self.entries.iter().any(|e| organization.contains(e.as_str()))
    }
}
