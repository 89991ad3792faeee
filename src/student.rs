use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::dietary::normalize_tags;
use crate::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DietaryTagKind {
    Allergy,
    Restriction,
}

impl DietaryTagKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Allergy => "ALLERGY",
            Self::Restriction => "RESTRICTION",
        }
    }
}

impl std::str::FromStr for DietaryTagKind {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLERGY" => Ok(Self::Allergy),
            "RESTRICTION" => Ok(Self::Restriction),
            _ => Err(PersistenceError::InvalidTagKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub school_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub dietary_restrictions: Vec<String>,
}

impl Student {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, PersistenceError> {
        let Some(row) =
            sqlx::query("SELECT id, school_id, parent_id, name, phone FROM students WHERE id = ?1")
                .bind(id)
                .fetch_optional(pool)
                .await?
        else {
            return Ok(None);
        };

        let tags = sqlx::query_as::<_, (String, String)>(
            "SELECT kind, tag FROM student_dietary_tags WHERE student_id = ?1 ORDER BY tag",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        let mut allergies = Vec::new();
        let mut dietary_restrictions = Vec::new();
        for (kind, tag) in tags {
            match kind.parse::<DietaryTagKind>()? {
                DietaryTagKind::Allergy => allergies.push(tag),
                DietaryTagKind::Restriction => dietary_restrictions.push(tag),
            }
        }

        Ok(Some(Self {
            id: row.try_get("id")?,
            school_id: row.try_get("school_id")?,
            parent_id: row.try_get("parent_id")?,
            name: row.try_get("name")?,
            phone: row.try_get("phone")?,
            allergies,
            dietary_restrictions,
        }))
    }

    /// Inserts or replaces the student together with their dietary tags.
    pub async fn upsert(&self, pool: &SqlitePool) -> Result<(), PersistenceError> {
        let mut sql_tx = pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO students (id, school_id, parent_id, name, phone) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                school_id = excluded.school_id,
                parent_id = excluded.parent_id,
                name = excluded.name,
                phone = excluded.phone
            ",
        )
        .bind(&self.id)
        .bind(&self.school_id)
        .bind(&self.parent_id)
        .bind(&self.name)
        .bind(&self.phone)
        .execute(sql_tx.as_mut())
        .await?;

        sqlx::query("DELETE FROM student_dietary_tags WHERE student_id = ?1")
            .bind(&self.id)
            .execute(sql_tx.as_mut())
            .await?;

        let tagged = normalize_tags(&self.allergies)
            .into_iter()
            .map(|tag| (DietaryTagKind::Allergy, tag))
            .chain(
                normalize_tags(&self.dietary_restrictions)
                    .into_iter()
                    .map(|tag| (DietaryTagKind::Restriction, tag)),
            );

        for (kind, tag) in tagged {
            sqlx::query("INSERT INTO student_dietary_tags (student_id, kind, tag) VALUES (?1, ?2, ?3)")
                .bind(&self.id)
                .bind(kind.as_str())
                .bind(tag)
                .execute(sql_tx.as_mut())
                .await?;
        }

        sql_tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{StudentBuilder, setup_test_db};

    #[tokio::test]
    async fn test_upsert_and_find_with_tags() {
        let pool = setup_test_db().await;
        let student = StudentBuilder::new("s-1")
            .with_allergies(&["peanuts", "Shellfish"])
            .with_dietary_restrictions(&["vegetarian"])
            .build();

        student.upsert(&pool).await.unwrap();

        let found = Student::find_by_id(&pool, "s-1").await.unwrap().unwrap();
        assert_eq!(found.allergies, vec!["PEANUTS", "SHELLFISH"]);
        assert_eq!(found.dietary_restrictions, vec!["VEGETARIAN"]);
        assert_eq!(found.parent_id, student.parent_id);
    }

    #[tokio::test]
    async fn test_upsert_replaces_tags() {
        let pool = setup_test_db().await;
        StudentBuilder::new("s-1")
            .with_allergies(&["EGG"])
            .build()
            .upsert(&pool)
            .await
            .unwrap();
        StudentBuilder::new("s-1")
            .with_allergies(&["DAIRY"])
            .build()
            .upsert(&pool)
            .await
            .unwrap();

        let found = Student::find_by_id(&pool, "s-1").await.unwrap().unwrap();
        assert_eq!(found.allergies, vec!["DAIRY"]);
    }

    #[tokio::test]
    async fn test_find_missing_student() {
        let pool = setup_test_db().await;
        assert!(Student::find_by_id(&pool, "nobody").await.unwrap().is_none());
    }

    #[test]
    fn test_import_format_defaults() {
        let student: Student = serde_json::from_str(
            r#"{"id": "s-9", "schoolId": "school-1", "name": "Asha"}"#,
        )
        .unwrap();
        assert!(student.allergies.is_empty());
        assert!(student.parent_id.is_none());
    }
}
