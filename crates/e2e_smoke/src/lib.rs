//! End-to-end smoke tests for the roster service live under `tests/`.
