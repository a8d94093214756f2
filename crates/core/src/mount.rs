use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::media::MediaFactory;
use crate::protocol::RtspUrl;

/// Registry of media factories keyed by mount path (e.g. `/stream`,
/// `/camera1`).
///
/// Lookups pick the longest registered path that is a prefix of the
/// request path on a `/` boundary, so `/cam` serves `/cam/stream=0` but not
/// `/camera`. Cloning is cheap and every clone shares the same mounts.
#[derive(Clone, Default)]
pub struct MountPoints {
    mounts: Arc<RwLock<HashMap<String, Arc<MediaFactory>>>>,
}

impl MountPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Replaces any existing factory at the same path.
    pub fn add_factory(&self, path: &str, factory: MediaFactory) -> Arc<MediaFactory> {
        let factory = Arc::new(factory);
        self.mounts.write().insert(path.to_string(), factory.clone());
        tracing::info!(path, "mount registered");
        factory
    }

    pub fn remove_factory(&self, path: &str) -> bool {
        let removed = self.mounts.write().remove(path).is_some();
        if removed {
            tracing::info!(path, "mount removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }

    /// The factory for `path` and the length of the mount path it matched.
    pub fn match_path(&self, path: &str) -> Option<(Arc<MediaFactory>, usize)> {
        let mounts = self.mounts.read();
        let found = mounts
            .iter()
            .filter(|(mount, _)| {
                let Some(rest) = path.strip_prefix(mount.as_str()) else {
                    return false;
                };
                rest.is_empty() || rest.starts_with('/') || mount.ends_with('/')
            })
            .max_by_key(|(mount, _)| mount.len())
            .map(|(mount, factory)| (factory.clone(), mount.len()));
        if found.is_none() {
            tracing::debug!(path, "no factory for path");
        }
        found
    }

    /// The lookup path for `url`: its absolute path plus `?query`.
    pub fn make_path(&self, url: &RtspUrl) -> String {
        let mut path = if url.abspath.is_empty() {
            "/".to_string()
        } else {
            url.abspath.clone()
        };
        if let Some(query) = &url.query {
            path.push('?');
            path.push_str(query);
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamConfig;

    fn factory() -> MediaFactory {
        MediaFactory::new().with_stream(StreamConfig::h264(96))
    }

    #[test]
    fn longest_prefix_on_segment_boundary() {
        let mounts = MountPoints::new();
        mounts.add_factory("/cam", factory());
        mounts.add_factory("/cam/hd", factory());

        assert_eq!(mounts.match_path("/cam").unwrap().1, 4);
        assert_eq!(mounts.match_path("/cam/stream=0").unwrap().1, 4);
        assert_eq!(mounts.match_path("/cam/hd/stream=0").unwrap().1, 7);
        assert!(mounts.match_path("/camera").is_none());
    }

    #[test]
    fn root_mount_matches_everything() {
        let mounts = MountPoints::new();
        mounts.add_factory("/", factory());
        assert_eq!(mounts.match_path("/anything").unwrap().1, 1);
    }

    #[test]
    fn make_path_keeps_query() {
        let mounts = MountPoints::new();
        let url = RtspUrl::parse("rtsp://h:8554/live?res=hd").unwrap();
        assert_eq!(mounts.make_path(&url), "/live?res=hd");
        let url = RtspUrl::parse("rtsp://h:8554").unwrap();
        assert_eq!(mounts.make_path(&url), "/");
    }

    #[test]
    fn remove_factory() {
        let mounts = MountPoints::new();
        mounts.add_factory("/a", factory());
        assert!(mounts.remove_factory("/a"));
        assert!(!mounts.remove_factory("/a"));
        assert!(mounts.is_empty());
    }
}
