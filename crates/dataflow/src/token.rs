// SPDX-License-Identifier: Apache-2.0

//! Tokens: the data units flowing along graph edges.

use taskmill_runtime::Annotation;

/// A piece of data travelling along an edge, together with the scheduling
/// annotation of the task that will consume it.
#[derive(Debug)]
pub struct Token<T> {
    data: T,
    annotation: Annotation,
}

impl<T> Token<T> {
    /// Wraps data with a default (execute-locally) annotation.
    pub fn new(data: T) -> Self {
        Self {
            data,
            annotation: Annotation::default(),
        }
    }

    /// Wraps data with an explicit scheduling annotation, e.g. naming the
    /// resource the consuming task will touch.
    pub fn with_annotation(data: T, annotation: impl Into<Annotation>) -> Self {
        Self {
            data,
            annotation: annotation.into(),
        }
    }

    /// The payload.
    #[must_use]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// The payload, mutable.
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// The scheduling annotation of the consuming task.
    #[must_use]
    pub fn annotation(&self) -> Annotation {
        self.annotation
    }

    /// Splits the token into payload and annotation.
    pub fn into_parts(self) -> (T, Annotation) {
        (self.data, self.annotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmill_runtime::Target;

    #[test]
    fn test_token_carries_annotation() {
        let token = Token::with_annotation(42u64, Target::Worker(2));
        assert_eq!(*token.data(), 42);
        assert_eq!(token.annotation().target, Target::Worker(2));

        let (data, annotation) = token.into_parts();
        assert_eq!(data, 42);
        assert_eq!(annotation.target, Target::Worker(2));
    }
}
