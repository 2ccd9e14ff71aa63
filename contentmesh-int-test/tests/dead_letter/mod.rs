mod dead_letter_test;
