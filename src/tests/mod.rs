//! Integration tests over in-memory git and tmux fakes

mod support;

mod supervisor_tests;
