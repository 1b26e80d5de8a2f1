//! The fixed set of programming tasks a duel can be played on.
//!
//! A [`Task`] names a C function to implement and lists the test vectors a submission must
//! satisfy. Vectors are public: they are sent to both players in `game_started`.

use std::sync::Arc;

use anyhow::{bail, ensure};
use rand::{seq::IndexedRandom, RngCore};
use serde::Serialize;

/// One `(inputs, expected)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestVector {
    pub inputs: Vec<i64>,
    pub expected: i64,
}

impl TestVector {
    pub fn new(inputs: impl Into<Vec<i64>>, expected: i64) -> Self {
        Self {
            inputs: inputs.into(),
            expected,
        }
    }
}

/// An immutable task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub title: String,
    pub description: String,
    pub function_name: String,
    pub test_vectors: Vec<TestVector>,
}

impl Task {
    /// Validates and builds a task.
    ///
    /// # Errors
    ///
    /// Fails when there is no vector, when `function_name` is not a C identifier, or when the
    /// vectors do not all have the same number of inputs.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        function_name: impl Into<String>,
        test_vectors: Vec<TestVector>,
    ) -> anyhow::Result<Task> {
        let function_name = function_name.into();
        ensure!(
            is_c_identifier(&function_name),
            "'{function_name}' is not a valid C identifier"
        );
        let Some(first) = test_vectors.first() else {
            bail!("task '{function_name}' has no test vector");
        };
        let arity = first.inputs.len();
        if let Some(pos) = test_vectors.iter().position(|v| v.inputs.len() != arity) {
            bail!(
                "test vector {} of '{function_name}' has {} inputs, expected {arity}",
                pos + 1,
                test_vectors[pos].inputs.len()
            );
        }
        Ok(Task {
            title: title.into(),
            description: description.into(),
            function_name,
            test_vectors,
        })
    }

    /// Number of parameters of the target function.
    pub fn arity(&self) -> usize {
        self.test_vectors.first().map_or(0, |v| v.inputs.len())
    }
}

fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name != "main"
}

/// Read-only collection of tasks.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    tasks: Vec<Arc<Task>>,
}

impl TaskCatalog {
    /// # Errors
    ///
    /// Fails on an empty task list.
    pub fn new(tasks: Vec<Task>) -> anyhow::Result<TaskCatalog> {
        ensure!(!tasks.is_empty(), "task catalog is empty");
        Ok(TaskCatalog {
            tasks: tasks.into_iter().map(Arc::new).collect(),
        })
    }

    /// Picks one task. Draws are independent: concurrent sessions may share a task.
    pub fn pick(&self, rng: &mut dyn RngCore) -> Arc<Task> {
        // `new` guarantees at least one task
        self.tasks
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| self.tasks[0].clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().map(Arc::as_ref)
    }

    /// The tasks shipped with the server.
    ///
    /// # Errors
    ///
    /// Only fails if a builtin definition is broken.
    pub fn builtin() -> anyhow::Result<TaskCatalog> {
        fn v(inputs: &[i64], expected: i64) -> TestVector {
            TestVector::new(inputs, expected)
        }

        let tasks = vec![
            Task::new(
                "Sum of two numbers",
                "Write a function int sum(int a, int b) that returns the sum of two numbers.",
                "sum",
                vec![v(&[2, 3], 5), v(&[10, 15], 25), v(&[-5, 8], 3), v(&[0, 0], 0)],
            ),
            Task::new(
                "Largest of three numbers",
                "Write a function int max_of_three(int a, int b, int c) that returns the largest of three numbers.",
                "max_of_three",
                vec![
                    v(&[1, 2, 3], 3),
                    v(&[5, 2, 1], 5),
                    v(&[2, 8, 4], 8),
                    v(&[-1, -2, -3], -1),
                    v(&[10, 10, 5], 10),
                ],
            ),
            Task::new(
                "Factorial",
                "Write a function int factorial(int n) that returns n!.",
                "factorial",
                vec![v(&[0], 1), v(&[1], 1), v(&[3], 6), v(&[5], 120), v(&[7], 5040)],
            ),
            Task::new(
                "Prime check",
                "Write a function int is_prime(int n) that returns 1 if n is a prime number and 0 otherwise.",
                "is_prime",
                vec![
                    v(&[2], 1),
                    v(&[3], 1),
                    v(&[4], 0),
                    v(&[7], 1),
                    v(&[9], 0),
                    v(&[17], 1),
                ],
            ),
            Task::new(
                "Fibonacci",
                "Write a function int fibonacci(int n) that returns the n-th Fibonacci number (starting from 0).",
                "fibonacci",
                vec![v(&[0], 0), v(&[1], 1), v(&[2], 1), v(&[5], 5), v(&[8], 21)],
            ),
            Task::new(
                "Digit sum",
                "Write a function int digit_sum(int n) that returns the sum of the digits of n.",
                "digit_sum",
                vec![
                    v(&[123], 6),
                    v(&[456], 15),
                    v(&[7], 7),
                    v(&[1000], 1),
                    v(&[9876], 30),
                ],
            ),
        ];

        TaskCatalog::new(tasks.into_iter().collect::<anyhow::Result<Vec<_>>>()?)
    }
}
