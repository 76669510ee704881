//! Query string builder.
//!
//! The remote API expects repeated array parameters as `key[]=a&key[]=b`,
//! which generic form encoders do not produce, so the encoding is explicit.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, bool, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, key: &str, value: impl ToString) -> Self {
        self.pairs.push((key.to_string(), false, value.to_string()));
        self
    }

    /// Adds one `key[]=value` pair per value
    pub fn push_array<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        for value in values {
            self.pairs.push((key.to_string(), true, value.to_string()));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(key, is_array, value)| {
                let brackets = if *is_array { "[]" } else { "" };
                format!(
                    "{}{}={}",
                    urlencoding::encode(key),
                    brackets,
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_parameters_repeat_the_key() {
        let query = QueryParams::new()
            .push_array("calendar_ids", [3, 7])
            .push("from", "2024-03-01");
        assert_eq!(
            query.encode(),
            "calendar_ids[]=3&calendar_ids[]=7&from=2024-03-01"
        );
    }

    #[test]
    fn test_values_are_percent_encoded() {
        let query = QueryParams::new().push("q", "a b&c=d");
        assert_eq!(query.encode(), "q=a%20b%26c%3Dd");
    }

    #[test]
    fn test_empty() {
        assert!(QueryParams::new().is_empty());
        assert_eq!(QueryParams::new().encode(), "");
        let empty_array: [i64; 0] = [];
        assert!(QueryParams::new().push_array("ids", empty_array).is_empty());
    }
}
