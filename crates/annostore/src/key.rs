use std::fmt;

/// Identifier of the project a container belongs to.
pub type ProjectId = i64;

/// What a container is stored for: a document, or a special-purpose slot of the project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyTarget {
    Document(i64),
    SpecialPurpose(String),
}

/// Identity of a container instance.
///
/// Keys are built per call and never mutated. They are the only identity used by the pool,
/// the shared cache and the session ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessKey {
    project: ProjectId,
    target: KeyTarget,
    user: String,
}

impl AccessKey {
    pub fn new(project: ProjectId, target: KeyTarget, user: impl Into<String>) -> Self {
        Self { project, target, user: user.into() }
    }

    pub fn document(project: ProjectId, document: i64, user: impl Into<String>) -> Self {
        Self::new(project, KeyTarget::Document(document), user)
    }

    pub fn special_purpose(
        project: ProjectId,
        tag: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self::new(project, KeyTarget::SpecialPurpose(tag.into()), user)
    }

    pub const fn project(&self) -> ProjectId {
        self.project
    }

    pub const fn target(&self) -> &KeyTarget {
        &self.target
    }

    pub const fn document_id(&self) -> Option<i64> {
        match self.target {
            KeyTarget::Document(id) => Some(id),
            KeyTarget::SpecialPurpose(_) => None,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub const fn belongs_to(&self, project: ProjectId) -> bool {
        self.project == project
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            KeyTarget::Document(id) => write!(f, "[{}:{id}@{}]", self.project, self.user),
            KeyTarget::SpecialPurpose(tag) => write!(f, "[{}:#{tag}@{}]", self.project, self.user),
        }
    }
}
