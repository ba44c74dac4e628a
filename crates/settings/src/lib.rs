//! Workspace-wide preferences: opaque key/value entries plus bounded rankings.
//! 工作區偏好設定：一般鍵值項目與有上限的排行清單。

pub mod preferences;
pub mod top_list;

pub use preferences::{
    PreferenceError, PreferenceStore, PreferenceValue, EXPRESSIONS_KEY,
    EXPRESSION_HISTORY_CAPACITY,
};
pub use top_list::{is_top_list_class, TopList, TOP_LIST_CLASS};
