use crate::message::Message;

pub const QUERY_PARAM: &str = "q";
pub const MODEL_PARAM: &str = "model";

/// Deep-link parameters captured when a session view opens.
///
/// Read once at mount; later changes to the link are not observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchParams {
    initial_query: Option<String>,
    initial_model: Option<String>,
}

impl LaunchParams {
    pub fn new(initial_query: Option<String>, initial_model: Option<String>) -> Self {
        Self {
            initial_query: initial_query.filter(|query| !query.is_empty()),
            initial_model: initial_model
                .map(|model| model.trim().to_string())
                .filter(|model| !model.is_empty()),
        }
    }

    /// Parses `q` and `model` from a query string, with or without the leading `?`.
    ///
    /// The first occurrence of each key wins.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    /// Accepts a full link (`palaver://c/<id>?q=..`) or a bare path (`/c/<id>?q=..`).
    pub fn from_link(link: &str) -> Self {
        match url::Url::parse(link) {
            Ok(parsed) => Self::from_pairs(parsed.query_pairs()),
            Err(_) => link
                .split_once('?')
                .map(|(_, query)| Self::from_query(query))
                .unwrap_or_default(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut initial_query = None;
        let mut initial_model = None;
        for (key, value) in pairs {
            match key.as_ref() {
                QUERY_PARAM if initial_query.is_none() => {
                    initial_query = Some(value.as_ref().to_string());
                }
                MODEL_PARAM if initial_model.is_none() => {
                    initial_model = Some(value.as_ref().to_string());
                }
                _ => {}
            }
        }
        Self::new(initial_query, initial_model)
    }

    pub fn initial_query(&self) -> Option<&str> {
        self.initial_query.as_deref()
    }

    pub fn initial_model(&self) -> Option<&str> {
        self.initial_model.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.initial_query.is_none() && self.initial_model.is_none()
    }

    /// User message synthesized from the deep-link question.
    pub fn seed_message(&self) -> Option<Message> {
        self.initial_query.as_deref().map(Message::user)
    }
}
