//! Identity of one datafile stream.
use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

const PROJECT_URL_DIR: &str = "json";
const SDK_KEY_URL_DIR: &str = "datafiles";

/// Identifies one logical datafile stream.
///
/// A key is built either from a project id or from an environment (SDK) key. The kind is kept
/// explicitly, including in persisted state, so a stored key never has to be re-classified from
/// its characters.
///
/// Serialized form: `{"kind": "projectId", "value": "10192104166"}`.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ConfigKey {
    /// Legacy project-scoped datafile.
    #[display(fmt = "{}", _0)]
    ProjectId(String),
    /// Environment-scoped datafile.
    #[display(fmt = "{}", _0)]
    SdkKey(String),
}

impl ConfigKey {
    /// Build a key from caller-supplied identifiers.
    ///
    /// The SDK key takes precedence when both are present. Empty strings count as absent.
    ///
    /// ```
    /// # use datafile_sync::ConfigKey;
    /// let key = ConfigKey::new(Some("10192104166"), None).unwrap();
    /// assert_eq!(key, ConfigKey::ProjectId("10192104166".to_owned()));
    /// ```
    pub fn new(project_id: Option<&str>, sdk_key: Option<&str>) -> Result<ConfigKey> {
        let project_id = project_id.filter(|id| !id.is_empty());
        let sdk_key = sdk_key.filter(|key| !key.is_empty());

        match (project_id, sdk_key) {
            (_, Some(sdk_key)) => {
                if project_id.is_some() {
                    log::debug!(target: "datafile_sync", "both project id and sdk key given, using sdk key");
                }
                Ok(ConfigKey::SdkKey(sdk_key.to_owned()))
            }
            (Some(project_id), None) => Ok(ConfigKey::ProjectId(project_id.to_owned())),
            (None, None) => {
                log::error!(target: "datafile_sync", "config key requires a project id or an sdk key");
                Err(Error::InvalidConfigKey)
            }
        }
    }

    /// The raw identifier. Used for naming the datafile cache file.
    pub fn cache_key(&self) -> &str {
        match self {
            ConfigKey::ProjectId(id) | ConfigKey::SdkKey(id) => id,
        }
    }

    /// The identifier qualified by its kind, e.g. `projectId:42`. Keys persisted state that
    /// must not mix up a project id and an SDK key with the same value.
    ///
    /// ```
    /// # use datafile_sync::ConfigKey;
    /// assert_eq!(ConfigKey::SdkKey("abc".to_owned()).storage_id(), "sdkKey:abc");
    /// ```
    pub fn storage_id(&self) -> String {
        match self {
            ConfigKey::ProjectId(id) => format!("projectId:{id}"),
            ConfigKey::SdkKey(key) => format!("sdkKey:{key}"),
        }
    }

    /// Build the datafile URL for this key on `host`.
    ///
    /// ```
    /// # use datafile_sync::ConfigKey;
    /// let key = ConfigKey::SdkKey("abc".to_owned());
    /// assert_eq!(
    ///     key.url("https://cdn.optimizely.com").unwrap(),
    ///     "https://cdn.optimizely.com/datafiles/abc.json"
    /// );
    /// ```
    ///
    /// The identifier is percent-encoded as a single path segment, so `/`, `?` or `#` in it
    /// cannot change the request path.
    pub fn url(&self, host: &str) -> Result<String> {
        let dir = match self {
            ConfigKey::ProjectId(_) => PROJECT_URL_DIR,
            ConfigKey::SdkKey(_) => SDK_KEY_URL_DIR,
        };

        let file_name = format!("{}.json", self.cache_key());

        let mut url = Url::parse(host).map_err(Error::InvalidBaseUrl)?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend([dir, file_name.as_str()]);

        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigKey;
    use crate::Error;

    #[test]
    fn sdk_key_wins_over_project_id() {
        let key = ConfigKey::new(Some("1"), Some("sdk")).unwrap();
        assert_eq!(key, ConfigKey::SdkKey("sdk".to_owned()));
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(matches!(
            ConfigKey::new(None, None),
            Err(Error::InvalidConfigKey)
        ));
        assert!(matches!(
            ConfigKey::new(Some(""), Some("")),
            Err(Error::InvalidConfigKey)
        ));
    }

    #[test]
    fn empty_sdk_key_falls_back_to_project_id() {
        let key = ConfigKey::new(Some("42"), Some("")).unwrap();
        assert_eq!(key, ConfigKey::ProjectId("42".to_owned()));
    }

    #[test]
    fn project_url_template() {
        let key = ConfigKey::ProjectId("42".to_owned());
        assert_eq!(
            key.url("https://cdn.example.com/").unwrap(),
            "https://cdn.example.com/json/42.json"
        );
    }

    #[test]
    fn identifier_is_encoded_as_one_path_segment() {
        let key = ConfigKey::SdkKey("a/b?c#d".to_owned());
        assert_eq!(
            key.url("https://cdn.example.com").unwrap(),
            "https://cdn.example.com/datafiles/a%2Fb%3Fc%23d.json"
        );
    }

    #[test]
    fn host_path_prefix_is_kept() {
        let key = ConfigKey::SdkKey("abc".to_owned());
        assert_eq!(
            key.url("https://cdn.example.com/mirror/").unwrap(),
            "https://cdn.example.com/mirror/datafiles/abc.json"
        );
    }

    #[test]
    fn host_without_path_support_is_an_error() {
        let key = ConfigKey::SdkKey("abc".to_owned());
        assert!(matches!(
            key.url("mailto:cdn@example.com"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn storage_id_distinguishes_kinds() {
        assert_eq!(ConfigKey::ProjectId("1".to_owned()).storage_id(), "projectId:1");
        assert_eq!(ConfigKey::SdkKey("1".to_owned()).storage_id(), "sdkKey:1");
    }

    #[test]
    fn invalid_host_is_an_error() {
        let key = ConfigKey::SdkKey("abc".to_owned());
        assert!(matches!(
            key.url("not a host"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn serializes_as_tagged_variant() {
        let key = ConfigKey::SdkKey("abc".to_owned());
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "sdkKey", "value": "abc"}));

        let back: ConfigKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn kinds_with_same_value_are_distinct() {
        assert_ne!(
            ConfigKey::ProjectId("1".to_owned()),
            ConfigKey::SdkKey("1".to_owned())
        );
    }
}
