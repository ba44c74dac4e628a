use std::collections::VecDeque;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 類別標記，寫入 JSON 以辨識排行清單。 / Class marker written into JSON so a top list can be told apart from plain values.
pub const TOP_LIST_CLASS: &str = "TopList";

/// 判斷類別名稱是否代表排行清單；接受舊版完整類別路徑。 / Whether `class` names a ranking, either the short marker or a
/// legacy package-qualified name such as `com.example.preference.TopList`.
pub fn is_top_list_class(class: &str) -> bool {
    class == TOP_LIST_CLASS
        || class
            .strip_suffix(TOP_LIST_CLASS)
            .is_some_and(|package| package.ends_with('.'))
}

/// 有上限的最近使用排行（最新者在前）。 / Bounded most-recent-first ranking of strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopList {
    top: usize,
    list: VecDeque<String>,
}

impl TopList {
    /// 空白排行，最多保留 `top` 筆（至少一筆）。 / Empty ranking bounded to `top` expressions; zero is raised to one.
    pub fn new(top: usize) -> Self {
        let top = top.max(1);
        Self {
            top,
            list: VecDeque::with_capacity(top),
        }
    }

    /// 依序列化資料還原清單。 / Reconstructs the ranking from persisted entries, newest first.
    pub fn with_entries(top: usize, entries: Vec<String>) -> Self {
        let mut list = Self::new(top);
        for entry in entries {
            if !list.list.contains(&entry) {
                list.list.push_back(entry);
            }
        }
        list.list.truncate(list.top);
        list
    }

    /// 排行上限。 / Bound on the number of ranked expressions.
    pub fn top(&self) -> usize {
        self.top
    }

    /// 變更上限；最舊的運算式先被捨棄。 / Changes the bound, dropping the oldest expressions beyond it.
    pub fn set_top(&mut self, top: usize) {
        self.top = top.max(1);
        self.list.truncate(self.top);
    }

    /// 記錄一次使用：運算式移到最前，超出上限者由尾端捨棄。 / Records a use: the expression moves to the front and the tail is cut to the bound.
    pub fn add(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        self.list.retain(|existing| existing != &entry);
        self.list.push_front(entry);
        self.list.truncate(self.top);
    }

    /// 自排行中刪去運算式。 / Forgets `entry`; `false` when it was not ranked.
    pub fn remove(&mut self, entry: &str) -> bool {
        let initial_len = self.list.len();
        self.list.retain(|existing| existing != entry);
        initial_len != self.list.len()
    }

    /// 以舊版陣列內容取代目前排行。 / Replaces the ranking with entries from a legacy array.
    pub fn replace_entries(&mut self, entries: Vec<String>) {
        *self = Self::with_entries(self.top, entries);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.list.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }
}

#[derive(Serialize, Deserialize)]
struct TopListRepr {
    class: String,
    top: usize,
    #[serde(default)]
    list: Vec<String>,
}

impl Serialize for TopList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        TopListRepr {
            class: TOP_LIST_CLASS.to_string(),
            top: self.top,
            list: self.list.iter().cloned().collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TopList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = TopListRepr::deserialize(deserializer)?;
        if !is_top_list_class(&repr.class) {
            return Err(D::Error::custom(format!(
                "expected class '{TOP_LIST_CLASS}', found '{}'",
                repr.class
            )));
        }
        Ok(Self::with_entries(repr.top, repr.list))
    }
}
