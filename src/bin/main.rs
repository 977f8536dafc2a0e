fn main() {
    hornet::main()
}
