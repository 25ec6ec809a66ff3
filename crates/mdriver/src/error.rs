//! Driver-level error type and the report printed on failure.

use core::{error::Error, fmt, iter};

use snafu::{Location, Snafu};

use crate::style::{Color, WithFg};

/// An ad hoc error raised while loading traces or setting up the run.
///
/// It remembers where it was raised so the report can point at the failing
/// step in the driver.
#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

impl GenericError {
    pub fn location(&self) -> &Location {
        &self.location
    }
}

/// Walks an error and all of its sources, outermost first.
fn chain<'a>(
    error: &'a (dyn Error + 'static),
) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    iter::successors(Some(error), |&e| e.source())
}

fn location_of<'a>(error: &'a (dyn Error + 'static)) -> Option<&'a Location> {
    error
        .downcast_ref::<GenericError>()
        .map(GenericError::location)
}

/// Formats an error together with its chain of sources.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, error) in chain(&self.error).enumerate() {
            let indent = if depth == 0 {
                write!(f, "Error: ")?;
                "  "
            } else {
                if depth == 1 {
                    writeln!(f, "\nCaused by:")?;
                }
                write!(f, "{:4}: ", depth - 1)?;
                "      "
            };
            writeln!(f, "{}", WithFg::new(Color::Red, error))?;
            if let Some(location) = location_of(error) {
                writeln!(f, "{indent}at {}", WithFg::new(Color::DarkGray, location))?;
            }
        }
        Ok(())
    }
}
