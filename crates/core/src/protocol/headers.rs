/// Ordered, multi-valued header list.
///
/// Names are stored as received; lookups are case-insensitive per
/// RFC 2326 §4.2. The same name may appear several times (`Require`,
/// `Accept`, ...), addressed by index with [`get_n`](Self::get_n).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_n(name, 0)
    }

    /// The `n`th value for `name`, counting only headers with that name.
    pub fn get_n(&self, name: &str, n: usize) -> Option<&str> {
        self.get_all(name).nth(n)
    }

    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Removes every header called `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// Replaces all values of `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.add(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn write_to(&self, out: &mut String) {
        for (name, value) in &self.0 {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_valued_lookup() {
        let mut h = Headers::new();
        h.add("Require", "foo");
        h.add("CSeq", "3");
        h.add("require", "bar");
        assert_eq!(h.get("REQUIRE"), Some("foo"));
        assert_eq!(h.get_n("Require", 1), Some("bar"));
        assert_eq!(h.get_n("Require", 2), None);

        h.remove("Require");
        assert_eq!(h.len(), 1);
        h.set("cseq", "4");
        assert_eq!(h.get("CSeq"), Some("4"));
        assert_eq!(h.len(), 1);
    }
}
