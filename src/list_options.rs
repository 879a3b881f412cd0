use serde::{Deserialize, Serialize};

use crate::error::FleetPackError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASC",
            OrderDirection::Descending => "DESC",
        }
    }
}

/// Caller-supplied ordering and pagination for list operations.
///
/// `per_page == 0` means "no limit". Order keys are validated against the
/// columns each listing exposes, so they never reach SQL unchecked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub page: u32,
    pub per_page: u32,
    pub order_key: Option<String>,
    pub order_direction: OrderDirection,
}

impl ListOptions {
    pub fn ordered_by(key: &str, direction: OrderDirection) -> Self {
        ListOptions {
            order_key: Some(key.to_owned()),
            order_direction: direction,
            ..Default::default()
        }
    }

    pub fn paged(mut self, page: u32, per_page: u32) -> Self {
        self.page = page;
        self.per_page = per_page;
        self
    }

    /// Appends ORDER BY / LIMIT / OFFSET to `sql`.
    ///
    /// `columns` maps externally visible order keys to SQL expressions.
    /// `tiebreak` is always appended so pages are stable.
    pub fn append_to_sql(
        &self,
        sql: &str,
        columns: &[(&str, &str)],
        tiebreak: &str,
    ) -> Result<String, FleetPackError> {
        let mut out = String::from(sql);

        match &self.order_key {
            Some(key) => {
                let column = columns
                    .iter()
                    .find(|(name, _)| *name == key.as_str())
                    .map(|(_, column)| *column)
                    .ok_or_else(|| FleetPackError::Validation {
                        name: key.clone(),
                        message: format!("invalid order key '{}'", key),
                    })?;
                out.push_str(&format!(
                    " ORDER BY {} {}, {} ASC",
                    column,
                    self.order_direction.as_sql(),
                    tiebreak
                ));
            }
            None => out.push_str(&format!(" ORDER BY {} ASC", tiebreak)),
        }

        if self.per_page > 0 {
            let offset = u64::from(self.page) * u64::from(self.per_page);
            out.push_str(&format!(" LIMIT {} OFFSET {}", self.per_page, offset));
        }

        Ok(out)
    }
}
