use itertools::Itertools;
use std::collections::BTreeSet;

use crate::error::DietaryConflict;
use crate::menu::MenuItem;
use crate::student::Student;

/// Allergen and restriction tags compare case-insensitively and ignore
/// surrounding whitespace, so "peanuts " and "PEANUTS" are the same tag.
pub(crate) fn normalize_tag(tag: &str) -> String {
    tag.trim().to_uppercase()
}

pub(crate) fn normalize_tags<'a>(tags: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    tags.into_iter()
        .map(|tag| normalize_tag(tag))
        .filter(|tag| !tag.is_empty())
        .sorted()
        .dedup()
        .collect()
}

/// Items whose allergens intersect the student's allergies or dietary
/// restrictions, in the order the items were given.
pub fn find_conflicts<'a>(
    student: &Student,
    items: impl IntoIterator<Item = &'a MenuItem>,
) -> Vec<DietaryConflict> {
    let avoid: BTreeSet<String> = student
        .allergies
        .iter()
        .chain(&student.dietary_restrictions)
        .map(|tag| normalize_tag(tag))
        .collect();

    if avoid.is_empty() {
        return Vec::new();
    }

    items
        .into_iter()
        .unique_by(|item| item.id.as_str())
        .filter_map(|item| {
            let tags = normalize_tags(&item.allergens)
                .into_iter()
                .filter(|allergen| avoid.contains(allergen))
                .collect::<Vec<_>>();

            (!tags.is_empty()).then(|| DietaryConflict {
                menu_item_id: item.id.clone(),
                menu_item_name: item.name.clone(),
                tags,
            })
        })
        .collect()
}
