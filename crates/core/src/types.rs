/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a story scene, assigned by the authoring frontend.
pub type SceneId = String;

/// Identifier of a shot within a scene.
pub type ShotId = String;
