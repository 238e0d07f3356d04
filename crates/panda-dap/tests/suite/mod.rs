mod stdio_server;
