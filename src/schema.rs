use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Number,
    Varbinary,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    None,
    ReadWrite,
}

/// A typed scalar sourced from the backend or from a query literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Number(String),
    Text(String),
}

impl SqlValue {
    /// Builds a value from a raw backend cell. Numeric-looking bytes become
    /// `Number`, everything else `Text`.
    pub fn from_bytes(raw: Option<&[u8]>) -> SqlValue {
        let Some(raw) = raw else {
            return SqlValue::Null;
        };
        let s = String::from_utf8_lossy(raw).into_owned();
        if s.parse::<i64>().is_ok() || s.parse::<f64>().is_ok() {
            SqlValue::Number(s)
        } else {
            SqlValue::Text(s)
        }
    }
}

/// Maps a MySQL type string ("int(11) unsigned", "varchar(128)", ...) to the
/// category the cache layer cares about. Matching is on the leading type word
/// so that e.g. geometry's "point" does not read as numeric.
pub fn category_for_type(column_type: &str) -> Category {
    let t = column_type.trim().to_ascii_lowercase();
    let word: String = t
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    match word.as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "float"
        | "double" | "decimal" | "numeric" | "bit" => Category::Number,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob"
        | "tinytext" | "text" | "mediumtext" | "longtext" | "char" | "varchar" => {
            Category::Varbinary
        }
        _ => Category::Other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub category: Category,
    pub default: SqlValue,
    /// Type modifier from `describe` ("auto_increment", "on update ...", "").
    pub extra: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    /// Parallel to `columns`; 0 when the backend reported none.
    pub cardinality: Vec<u64>,
    /// Columns this index physically covers, derived after load.
    pub data_columns: Vec<String>,
}

impl Index {
    pub fn new(name: impl Into<String>) -> Index {
        Index {
            name: name.into(),
            columns: Vec::new(),
            cardinality: Vec::new(),
            data_columns: Vec::new(),
        }
    }

    pub fn add_column(&mut self, name: impl Into<String>, cardinality: u64) {
        self.columns.push(name.into());
        self.cardinality.push(cardinality);
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn find_data_column(&self, name: &str) -> Option<usize> {
        self.data_columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<TableColumn>,
    /// The primary index, if any, sits at position 0.
    pub indexes: Vec<Index>,
    /// Positions of the PK columns in `columns`; empty when there is no PRIMARY.
    pub pk_columns: Vec<usize>,
    pub cache_type: CacheType,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Table {
        Table {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            pk_columns: Vec::new(),
            cache_type: CacheType::None,
        }
    }

    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        column_type: &str,
        default: SqlValue,
        extra: impl Into<String>,
    ) {
        self.columns.push(TableColumn {
            name: name.into(),
            category: category_for_type(column_type),
            default,
            extra: extra.into(),
        });
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn add_index(&mut self, name: impl Into<String>) -> &mut Index {
        self.indexes.push(Index::new(name));
        self.indexes.last_mut().unwrap()
    }

    pub fn has_primary(&self) -> bool {
        self.indexes.first().is_some_and(|i| i.name == "PRIMARY")
    }

    /// The column behind position `i` of the primary key.
    pub fn pk_column(&self, i: usize) -> &TableColumn {
        &self.columns[self.pk_columns[i]]
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_categories() {
        assert_eq!(category_for_type("int(11) unsigned"), Category::Number);
        assert_eq!(category_for_type("BIGINT(20)"), Category::Number);
        assert_eq!(category_for_type("decimal(10,2)"), Category::Number);
        assert_eq!(category_for_type("bit(1)"), Category::Number);
        assert_eq!(category_for_type("varchar(128)"), Category::Varbinary);
        assert_eq!(category_for_type("longblob"), Category::Varbinary);
        assert_eq!(category_for_type("char(3)"), Category::Varbinary);
        assert_eq!(category_for_type("datetime"), Category::Other);
        assert_eq!(category_for_type("enum('a','b')"), Category::Other);
        // Geometry must not read as numeric.
        assert_eq!(category_for_type("point"), Category::Other);
    }

    #[test]
    fn values_from_backend_bytes() {
        assert_eq!(SqlValue::from_bytes(None), SqlValue::Null);
        assert_eq!(
            SqlValue::from_bytes(Some(b"42")),
            SqlValue::Number("42".into())
        );
        assert_eq!(
            SqlValue::from_bytes(Some(b"-1.5")),
            SqlValue::Number("-1.5".into())
        );
        assert_eq!(
            SqlValue::from_bytes(Some(b"guest")),
            SqlValue::Text("guest".into())
        );
    }
}
