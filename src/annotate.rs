//! Turning compiler and runtime error text into something a learner can act on.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compiler::parse_diagnostics;

/// Error text handed to an annotator.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnnotationRequest<'a> {
    pub error: &'a str,
    pub source: &'a str,
    pub is_compilation_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReview {
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub explanation: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Review {
    /// Free text from a remote reviewer.
    Ai(String),
    Rules(ErrorReview),
}

impl Review {
    /// Plain-text rendering for terminal transports.
    pub fn render(&self) -> String {
        match self {
            Review::Ai(text) => text.clone(),
            Review::Rules(review) => {
                let mut out = String::new();
                if let Some(line) = review.line {
                    out.push_str(&format!("{} (line {line})\n", review.error_type));
                } else {
                    out.push_str(&format!("{}\n", review.error_type));
                }
                out.push_str(&review.explanation);
                out.push('\n');
                for suggestion in &review.suggestions {
                    out.push_str("\n• ");
                    out.push_str(suggestion);
                }
                out
            }
        }
    }
}

/// Downstream reviewer of error text. Never fails: no review is `None`.
pub trait ErrorAnnotator: Send + Sync {
    fn annotate<'a>(&'a self, request: AnnotationRequest<'a>) -> BoxFuture<'a, Option<Review>>;
}

/// Build the annotator selected by configuration.
pub fn from_config(url: Option<&str>, timeout: Duration) -> Arc<dyn ErrorAnnotator> {
    match url {
        Some(url) => match RemoteAnnotator::new(url, timeout) {
            Ok(remote) => Arc::new(remote),
            Err(e) => {
                warn!(error = %e, "Failed to build remote annotator client; using rules only");
                Arc::new(RuleAnnotator)
            }
        },
        None => Arc::new(RuleAnnotator),
    }
}

struct Rule {
    needle: &'static str,
    error_type: &'static str,
    explanation: &'static str,
    suggestions: &'static [&'static str],
}

const COMPILE_RULES: &[Rule] = &[
    Rule {
        needle: "cannot find symbol",
        error_type: "Undefined symbol",
        explanation: "The compiler does not know a variable, method or class you used.",
        suggestions: &[
            "Check the spelling and capitalization of the name",
            "Declare the variable before using it",
            "Add the missing import, e.g. import java.util.Scanner;",
        ],
    },
    Rule {
        needle: "';' expected",
        error_type: "Missing semicolon",
        explanation: "A statement is not terminated with a semicolon.",
        suggestions: &["Add ';' at the end of the statement on the reported line"],
    },
    Rule {
        needle: "incompatible types",
        error_type: "Type mismatch",
        explanation: "A value of one type is used where a different type is required.",
        suggestions: &[
            "Convert the value explicitly, e.g. Integer.parseInt(text)",
            "Change the declared type of the variable",
        ],
    },
    Rule {
        needle: "should be declared in a file named",
        error_type: "Class name mismatch",
        explanation: "A public class must live in a file with the same name.",
        suggestions: &["Keep only one public top-level class in the program"],
    },
    Rule {
        needle: "unreachable statement",
        error_type: "Unreachable code",
        explanation: "This statement can never run because of an earlier return, break or infinite loop.",
        suggestions: &["Remove the statement or move it before the return/break"],
    },
    Rule {
        needle: "missing return statement",
        error_type: "Missing return",
        explanation: "A method with a return type can reach its end without returning a value.",
        suggestions: &["Return a value on every path through the method"],
    },
    Rule {
        needle: "class, interface, enum, or record expected",
        error_type: "Code outside a class",
        explanation: "Java code must be written inside a class body.",
        suggestions: &["Check for an extra closing brace '}' above this line"],
    },
    Rule {
        needle: "reached end of file while parsing",
        error_type: "Unbalanced braces",
        explanation: "The file ended before every '{' was closed.",
        suggestions: &["Add the missing closing brace '}'"],
    },
];

const RUNTIME_RULES: &[Rule] = &[
    Rule {
        needle: "NullPointerException",
        error_type: "NullPointerException",
        explanation: "A method or field was used on a reference that is null.",
        suggestions: &[
            "Initialize the object before using it",
            "Check for null before dereferencing",
        ],
    },
    Rule {
        needle: "ArrayIndexOutOfBoundsException",
        error_type: "ArrayIndexOutOfBoundsException",
        explanation: "An array was accessed with an index outside 0..length-1.",
        suggestions: &["Loop with i < array.length rather than i <= array.length"],
    },
    Rule {
        needle: "StringIndexOutOfBoundsException",
        error_type: "StringIndexOutOfBoundsException",
        explanation: "A string was accessed with an index outside 0..length()-1.",
        suggestions: &["Check the string's length() before charAt or substring"],
    },
    Rule {
        needle: "IndexOutOfBoundsException",
        error_type: "IndexOutOfBoundsException",
        explanation: "A list was accessed with an index outside 0..size()-1.",
        suggestions: &["Check size() before calling get(index)"],
    },
    Rule {
        needle: "ArithmeticException",
        error_type: "ArithmeticException",
        explanation: "An arithmetic operation failed, most often an integer division by zero.",
        suggestions: &["Make sure the divisor is not zero before dividing"],
    },
    Rule {
        needle: "NumberFormatException",
        error_type: "NumberFormatException",
        explanation: "Text that is not a valid number was parsed as one.",
        suggestions: &["Trim the input and validate it before parsing"],
    },
    Rule {
        needle: "InputMismatchException",
        error_type: "InputMismatchException",
        explanation: "Scanner read input that does not match the requested type.",
        suggestions: &["Check the input format, or use hasNextInt() before nextInt()"],
    },
    Rule {
        needle: "NoSuchElementException",
        error_type: "NoSuchElementException",
        explanation: "The program asked for more input than was provided.",
        suggestions: &[
            "Provide input in the stdin field before running",
            "Guard reads with hasNext()/hasNextLine()",
        ],
    },
    Rule {
        needle: "StackOverflowError",
        error_type: "StackOverflowError",
        explanation: "Recursion went too deep, usually because a base case is never reached.",
        suggestions: &["Check the recursion's base case"],
    },
    Rule {
        needle: "OutOfMemoryError",
        error_type: "OutOfMemoryError",
        explanation: "The program ran out of heap memory.",
        suggestions: &["Look for collections that grow without bound"],
    },
    Rule {
        needle: "ClassCastException",
        error_type: "ClassCastException",
        explanation: "An object was cast to a type it is not an instance of.",
        suggestions: &["Check the type with instanceof before casting"],
    },
];

/// Pattern-based reviewer covering the most common javac and JVM failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleAnnotator;

impl RuleAnnotator {
    pub fn review(&self, request: AnnotationRequest<'_>) -> Option<Review> {
        let error = request.error.trim();
        if error.is_empty() {
            return None;
        }
        let (rules, line) = if request.is_compilation_error {
            (COMPILE_RULES, parse_diagnostics(error).first().map(|d| d.line))
        } else {
            (RUNTIME_RULES, stack_trace_line(error))
        };

        let review = match rules.iter().find(|rule| error.contains(rule.needle)) {
            Some(rule) => ErrorReview {
                error_type: rule.error_type.to_string(),
                line,
                explanation: rule.explanation.to_string(),
                suggestions: rule.suggestions.iter().map(|s| s.to_string()).collect(),
            },
            None if request.is_compilation_error => ErrorReview {
                error_type: "Compilation error".to_string(),
                line,
                explanation: "The compiler rejected the program.".to_string(),
                suggestions: vec!["Read the first error message; later errors often follow from it".to_string()],
            },
            None => ErrorReview {
                error_type: "Runtime error".to_string(),
                line,
                explanation: "The program stopped with an error.".to_string(),
                suggestions: vec!["Read the stack trace from the top to find where it failed".to_string()],
            },
        };
        Some(Review::Rules(review))
    }
}

impl ErrorAnnotator for RuleAnnotator {
    fn annotate<'a>(&'a self, request: AnnotationRequest<'a>) -> BoxFuture<'a, Option<Review>> {
        Box::pin(async move { self.review(request) })
    }
}

/// First `(File.java:N)` frame of a stack trace.
fn stack_trace_line(text: &str) -> Option<u32> {
    text.lines().find_map(|line| {
        let start = line.find(".java:")? + ".java:".len();
        let rest = &line[start..];
        let end = rest.find(')')?;
        rest[..end].parse().ok()
    })
}

#[derive(Debug, Deserialize)]
struct RemoteReview {
    review: Option<String>,
}

/// Forwards error text to an HTTP reviewer; falls back to [`RuleAnnotator`]
/// when it is unreachable or answers without a review.
#[derive(Debug, Clone)]
pub struct RemoteAnnotator {
    client: reqwest::Client,
    url: String,
    rules: RuleAnnotator,
}

impl RemoteAnnotator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            rules: RuleAnnotator,
        })
    }

    async fn ask(&self, request: AnnotationRequest<'_>) -> reqwest::Result<Option<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: RemoteReview = response.json().await?;
        Ok(body.review.filter(|text| !text.trim().is_empty()))
    }
}

impl ErrorAnnotator for RemoteAnnotator {
    fn annotate<'a>(&'a self, request: AnnotationRequest<'a>) -> BoxFuture<'a, Option<Review>> {
        Box::pin(async move {
            if request.error.trim().is_empty() {
                return None;
            }
            match self.ask(request).await {
                Ok(Some(text)) => return Some(Review::Ai(text)),
                Ok(None) => debug!(url = %self.url, "Remote annotator returned no review"),
                Err(e) => warn!(url = %self.url, error = %e, "Remote annotator failed"),
            }
            self.rules.review(request)
        })
    }
}
