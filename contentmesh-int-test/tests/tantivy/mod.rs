mod tantivy_test;
