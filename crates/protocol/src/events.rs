//! Event names carried in `Envelope::event`.

pub const HELLO: &str = "hello";

// Posts
pub const POSTED: &str = "posted";
pub const POST_EDITED: &str = "post_edited";
pub const POST_DELETED: &str = "post_deleted";
pub const POST_UPDATED: &str = "post_updated";
pub const POST_UNREAD: &str = "post_unread";
pub const EPHEMERAL_MESSAGE: &str = "ephemeral_message";
pub const REACTION_ADDED: &str = "reaction_added";
pub const REACTION_REMOVED: &str = "reaction_removed";
pub const EMOJI_ADDED: &str = "emoji_added";

// Channels
pub const CHANNEL_CONVERTED: &str = "channel_converted";
pub const CHANNEL_CREATED: &str = "channel_created";
pub const CHANNEL_DELETED: &str = "channel_deleted";
pub const CHANNEL_UNARCHIVED: &str = "channel_restored";
pub const CHANNEL_UPDATED: &str = "channel_updated";
pub const CHANNEL_VIEWED: &str = "channel_viewed";
pub const CHANNEL_MEMBER_UPDATED: &str = "channel_member_updated";
pub const DIRECT_ADDED: &str = "direct_added";
pub const GROUP_ADDED: &str = "group_added";

// Teams
pub const ADDED_TO_TEAM: &str = "added_to_team";
pub const LEAVE_TEAM: &str = "leave_team";
pub const UPDATE_TEAM: &str = "update_team";
pub const DELETE_TEAM: &str = "delete_team";

// Users
pub const NEW_USER: &str = "new_user";
pub const USER_ADDED: &str = "user_added";
pub const USER_REMOVED: &str = "user_removed";
pub const USER_UPDATED: &str = "user_updated";
pub const USER_ROLE_UPDATED: &str = "user_role_updated";
pub const STATUS_CHANGED: &str = "status_change";
pub const TYPING: &str = "typing";

// Preferences
pub const PREFERENCE_CHANGED: &str = "preference_changed";
pub const PREFERENCES_CHANGED: &str = "preferences_changed";
pub const PREFERENCES_DELETED: &str = "preferences_deleted";

// Server configuration
pub const PLUGIN_ENABLED: &str = "plugin_enabled";
pub const PLUGIN_DISABLED: &str = "plugin_disabled";
pub const PLUGIN_STATUSES_CHANGED: &str = "plugin_statuses_changed";
pub const CONFIG_CHANGED: &str = "config_changed";
pub const LICENSE_CHANGED: &str = "license_changed";

// Threads
pub const THREAD_UPDATED: &str = "thread_updated";
pub const THREAD_FOLLOW_CHANGED: &str = "thread_follow_changed";
pub const THREAD_READ_CHANGED: &str = "thread_read_changed";
