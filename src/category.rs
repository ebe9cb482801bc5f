//! Category resolver
//!
//! Matches user-supplied category labels against the known category list,
//! case- and diacritic-insensitively. A miss is a recoverable conversational
//! outcome carrying suggestions, never a hard error.

use serde::{Deserialize, Serialize};
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::models::{CategoryCandidate, EntryKind};
use crate::store::CategoryStore;
use crate::Result;

/// Diacritic-stripping case fold: NFD decomposition, drop combining marks,
/// lowercase, trim.
pub fn fold(input: &str) -> String {
    input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryMatch {
    pub id: Uuid,
    pub name: String,
}

/// Conversational payload surfaced when no category matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySuggestions {
    pub requested: String,
    pub kind: EntryKind,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum CategoryResolution {
    Matched(CategoryMatch),
    Suggestions(CategorySuggestions),
}

/// Resolve a requested label against the caller-supplied candidate list
/// first, then the authoritative store by folded name + kind.
pub async fn resolve_category(
    label: &str,
    kind: EntryKind,
    provided: Option<&[CategoryCandidate]>,
    store: &dyn CategoryStore,
) -> Result<CategoryResolution> {
    let folded = fold(label);

    if let Some(candidates) = provided {
        let hit = candidates.iter().find(|c| {
            fold(&c.name) == folded && c.kind.map_or(true, |candidate_kind| candidate_kind == kind)
        });

        if let Some(candidate) = hit {
            if let Some(id) = candidate.id {
                return Ok(CategoryResolution::Matched(CategoryMatch {
                    id,
                    name: candidate.name.clone(),
                }));
            }
            // Name-only candidate: the authoritative id lives in the store.
            if let Some(category) = store.find_by_folded_name(&folded, kind).await? {
                return Ok(CategoryResolution::Matched(CategoryMatch {
                    id: category.id,
                    name: category.name,
                }));
            }
        }
    }

    if let Some(category) = store.find_by_folded_name(&folded, kind).await? {
        return Ok(CategoryResolution::Matched(CategoryMatch {
            id: category.id,
            name: category.name,
        }));
    }

    let mut suggestions: Vec<String> = store
        .list_categories(Some(kind))
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();

    if suggestions.is_empty() {
        if let Some(candidates) = provided {
            suggestions = candidates
                .iter()
                .filter(|c| c.kind.map_or(true, |k| k == kind))
                .map(|c| c.name.clone())
                .collect();
        }
    }

    debug!(
        requested = %label,
        kind = %kind,
        suggestion_count = suggestions.len(),
        "Category not matched, returning suggestions"
    );

    Ok(CategoryResolution::Suggestions(CategorySuggestions {
        requested: label.to_string(),
        kind,
        suggestions,
    }))
}
