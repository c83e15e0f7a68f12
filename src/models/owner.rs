/// Authenticated owner attached to each request by the owner middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentOwner {
    pub id: String,
    /// Listed in `auth.admin_owners`
    pub is_admin: bool,
}
