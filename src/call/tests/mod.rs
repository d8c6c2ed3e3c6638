mod test_machine;
