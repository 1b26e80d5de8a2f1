//! Generation of the C program that checks a submission.
//!
//! The submitted source is embedded verbatim, followed by a driver calling the target function
//! once per test vector. Values go through [`c_literal`] and call descriptions through
//! [`c_string_literal`], never through raw text interpolation.

use std::fmt::Write;

use crate::task_catalog::{Task, TestVector};
use crate::verifier::workspace::COMPLETION_RECORD;

/// Name of the checking helper; prefixed to stay clear of identifiers a player might define.
const CHECK_FN: &str = "duel_harness_check";

const PRELUDE: &str = "#include <stdio.h>\n#include <stdlib.h>\n\n";

/// Renders `value` as a `long long` C expression.
///
/// `i64::MIN` has no literal form in C (`-9223372036854775808LL` is the negation of an
/// out-of-range literal), so it is spelled as an expression.
pub fn c_literal(value: i64) -> String {
    match value {
        i64::MIN => "(-9223372036854775807LL - 1)".to_string(),
        v if v < 0 => format!("(-{}LL)", v.unsigned_abs()),
        v => format!("{v}LL"),
    }
}

/// Renders `text` as a C string literal.
pub fn c_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            // no trigraphs
            '?' => out.push_str("\\?"),
            // `%` is safe: the string is passed as a `%s` argument, never as a format
            c if c.is_ascii_graphic() || c == ' ' => out.push(c),
            c => {
                let mut buf = [0; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    let _ = write!(out, "\\{byte:03o}");
                }
            }
        }
    }
    out.push('"');
    out
}

/// Human readable description of one call, e.g. `sum(2, -3)`.
pub fn describe_call(function_name: &str, vector: &TestVector) -> String {
    let args = vector
        .inputs
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{function_name}({args})")
}

/// Builds the full translation unit for `source` against `task`.
///
/// The resulting program takes a token as its only argument. When every vector matches it
/// writes the token to [`COMPLETION_RECORD`] and exits 0, so that a submission calling `exit(0)`
/// early is not mistaken for a pass. On the first mismatch it prints
/// `Test <n> failed: <call> expected <e>, got <actual>` on stderr and exits 1.
pub fn generate(source: &str, task: &Task) -> String {
    let mut program = String::with_capacity(source.len() + 1024);
    program.push_str(PRELUDE);
    program.push_str(source);
    if !source.ends_with('\n') {
        program.push('\n');
    }

    let _ = write!(
        program,
        "\nstatic int {CHECK_FN}(int index, const char *call, long long expected, long long actual)\n\
         {{\n\
         \x20   if (actual == expected) return 0;\n\
         \x20   fprintf(stderr, \"Test %d failed: %s expected %lld, got %lld\\n\", index, call, expected, actual);\n\
         \x20   return 1;\n\
         }}\n\
         \nint main(int argc, char **argv)\n{{\n\
         \x20   if (argc < 2) return 1;\n"
    );

    for (i, vector) in task.test_vectors.iter().enumerate() {
        let args = vector
            .inputs
            .iter()
            .map(|v| c_literal(*v))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            program,
            "    if ({CHECK_FN}({}, {}, {}, (long long){}({args}))) return 1;",
            i + 1,
            c_string_literal(&describe_call(&task.function_name, vector)),
            c_literal(vector.expected),
            task.function_name,
        );
    }

    let _ = write!(
        program,
        "    FILE *record = fopen({}, \"w\");\n\
         \x20   if (!record || fputs(argv[1], record) == EOF || fclose(record) != 0) return 1;\n\
         \x20   return 0;\n\
         }}\n",
        c_string_literal(COMPLETION_RECORD),
    );
    program
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_survive_edge_values() {
        assert_eq!(c_literal(0), "0LL");
        assert_eq!(c_literal(25), "25LL");
        assert_eq!(c_literal(-5), "(-5LL)");
        assert_eq!(c_literal(i64::MAX), "9223372036854775807LL");
        assert_eq!(c_literal(i64::MIN), "(-9223372036854775807LL - 1)");
    }

    #[test]
    fn string_literals_are_escaped() {
        assert_eq!(c_string_literal("f(1, -2)"), "\"f(1, -2)\"");
        assert_eq!(c_string_literal("a\"b\\c\n"), "\"a\\\"b\\\\c\\n\"");
        assert_eq!(c_string_literal("é"), "\"\\303\\251\"");
    }

    #[test]
    fn driver_checks_every_vector_in_order() {
        let task = Task::new(
            "Sum",
            "",
            "sum",
            vec![TestVector::new([2, 3], 5), TestVector::new([-5, 8], 3)],
        )
        .unwrap();
        let source = "int sum(int a, int b) { return a + b; }";
        let program = generate(source, &task);

        assert!(program.starts_with(PRELUDE));
        assert!(program.contains(source));
        let first = program
            .find("duel_harness_check(1, \"sum(2, 3)\", 5LL, (long long)sum(2LL, 3LL))")
            .unwrap();
        let second = program
            .find("duel_harness_check(2, \"sum(-5, 8)\", 3LL, (long long)sum((-5LL), 8LL))")
            .unwrap();
        assert!(first < second);
        assert!(program.trim_end().ends_with("return 0;\n}"));
    }

    #[test]
    fn completion_is_recorded_after_the_last_vector() {
        let task = Task::new("Sum", "", "sum", vec![TestVector::new([2, 3], 5)]).unwrap();
        let program = generate("int sum(int a, int b) { return a + b; }", &task);

        assert!(program.contains("int main(int argc, char **argv)"));
        let last_check = program.rfind("duel_harness_check(1,").unwrap();
        let record = program.find("fopen(\"duel.done\", \"w\")").unwrap();
        assert!(last_check < record);
        assert!(program.contains("fputs(argv[1], record)"));
    }

    #[test]
    fn describes_calls_with_plain_numbers() {
        assert_eq!(describe_call("f", &TestVector::new(Vec::new(), 1)), "f()");
        assert_eq!(describe_call("max", &TestVector::new([-1, 2, 3], 3)), "max(-1, 2, 3)");
    }
}
