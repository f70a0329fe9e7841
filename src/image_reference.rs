use std::fmt;

static DEFAULT_REGISTRY: &str = "index.docker.io";
static DEFAULT_NAMESPACE: &str = "library";
static DEFAULT_TAG: &str = "latest";

/// A parsed container image reference: `[host/]repository[:tag|@digest]`.
///
/// Parsing canonicalizes the way Docker does: a missing host resolves to
/// Docker Hub, and bare Docker Hub names get the `library/` namespace, so
/// `nginx` and `index.docker.io/library/nginx:latest` are the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub identifier: Identifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Tag(String),
    Digest(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingRepository,
    MissingTag,
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::MissingTag => write!(f, "tag is missing"),
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.identifier {
            Identifier::Tag(tag) => write!(f, ":{}", tag),
            Identifier::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // A digest takes precedence over any tag that precedes it
        let (base, digest) = match s.split_once('@') {
            Some((base, digest)) => {
                if !digest.contains(':') {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (base, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag
        let (name, tag) = match base.rfind(':') {
            Some(pos) if pos > base.rfind('/').unwrap_or(0) => {
                let tag = &base[pos + 1..];
                if tag.is_empty() {
                    return Err(ParseError::MissingTag);
                }
                (&base[..pos], Some(tag.to_string()))
            }
            _ => (base, None),
        };

        let identifier = match digest {
            Some(digest) => Identifier::Digest(digest),
            None => Identifier::Tag(tag.unwrap_or_else(|| DEFAULT_TAG.to_string())),
        };

        // The first path segment is a registry host only if it looks like one
        let (registry, mut repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        let registry = if registry == "docker.io" {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if !repository
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("{}/{}", DEFAULT_NAMESPACE, repository);
        }

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// The tag or digest string, without its separator.
    pub fn identifier_str(&self) -> &str {
        match &self.identifier {
            Identifier::Tag(tag) => tag,
            Identifier::Digest(digest) => digest,
        }
    }
}
