use std::fmt::{self, Display};

/// Errors collected from independent steps, rendered as `[a, b]`.
#[derive(Debug)]
pub struct Aggregate<E>(Vec<E>);

impl<E> Aggregate<E> {
    /// Wrap the collected errors, returning `None` when nothing failed.
    pub fn from_errors(errors: Vec<E>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<E: Display> Display for Aggregate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{single}");
        }
        f.write_str("[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
        }
        f.write_str("]")
    }
}

impl<E: Display + fmt::Debug> std::error::Error for Aggregate<E> {}
