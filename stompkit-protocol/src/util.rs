use crate::Error;

/// Convenience trait to easily convert errors to `Error::MalformedFrame`
pub trait ResultExt<T> {
    fn or_malformed(self, what: &str) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E> {
    fn or_malformed(self, what: &str) -> Result<T, Error> {
        self.or_else(|_| Err(Error::MalformedFrame(what.to_string())))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn or_malformed(self, what: &str) -> Result<T, Error> {
        self.ok_or_else(|| Error::MalformedFrame(what.to_string()))
    }
}
